// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Software reference driver
//!
//! An in-memory implementation of [`GlesDriver`] used by the headless host and
//! by the test suites. It models exactly what the renderer relies on:
//!
//! - texture storage in `RGB`/`RGBA` with `GL_UNSIGNED_BYTE` components,
//!   honouring the unpack alignment
//! - shareable images that alias texture storage
//! - framebuffer objects with completeness checks
//! - pbuffer and window surfaces, bound per thread
//! - a minimal shader front end: a shader compiles if it declares
//!   `void main` with balanced braces; a program links if it has one compiled
//!   vertex and one compiled fragment shader; attributes and uniforms get
//!   slots in declaration order
//! - a triangle rasterizer for textured geometry where the attribute in slot
//!   0 is the position, slot 1 the texture coordinate, and the first sampler
//!   uniform selects the texture unit (nearest sampling)
//!
//! All contexts share a single object namespace. Diagnostics (object counts,
//! call counter) and fault injection are available for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::debug;

use crate::gles::{
    valid_image_size, Binding, BufferId, BufferTarget, ContextId, Filter, Frame, FramebufferId,
    FramebufferStatus, GlError, GlesDriver, ImageId, NativeWindow, PixelFormat, PixelType,
    ProgramId, ShaderId, ShaderKind, SurfaceId, TexParam, TextureId, Viewport, Wrap,
    MAX_TEXTURE_SIZE,
};

const MAX_TEXTURE_UNITS: usize = 8;
const DEFAULT_UNPACK_ALIGNMENT: u32 = 4;
const EDGE_EPSILON: f32 = 1e-6;

/// Live object counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub textures: usize,
    pub framebuffers: usize,
    pub images: usize,
    pub buffers: usize,
    pub shaders: usize,
    pub programs: usize,
    pub contexts: usize,
    pub surfaces: usize,
}

impl ObjectCounts {
    /// GL objects, excluding contexts and surfaces
    pub fn gl_objects(&self) -> usize {
        self.textures + self.framebuffers + self.images + self.buffers + self.shaders + self.programs
    }
}

#[derive(Debug, Clone)]
struct Storage {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    refs: u32,
}

impl Storage {
    fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; width as usize * height as usize * format.components()],
            refs: 1,
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.format.components()
    }

    fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = self.offset(x, y);
        read_rgba(&self.data[offset..], self.format.components())
    }

    fn put(&mut self, x: u32, y: u32, pixel: [u8; 4]) {
        let offset = self.offset(x, y);
        let components = self.format.components();
        write_rgba(&mut self.data[offset..], components, pixel);
    }

    fn sample(&self, u: f32, v: f32, wrap: (Wrap, Wrap)) -> [u8; 4] {
        let x = wrap_coord(u, self.width, wrap.0);
        let y = wrap_coord(v, self.height, wrap.1);
        self.texel(x, y)
    }
}

fn wrap_coord(coord: f32, size: u32, wrap: Wrap) -> u32 {
    let texel = (coord * size as f32).floor() as i64;
    match wrap {
        Wrap::ClampToEdge => texel.clamp(0, i64::from(size) - 1) as u32,
        Wrap::Repeat => texel.rem_euclid(i64::from(size)) as u32,
    }
}

fn read_rgba(src: &[u8], components: usize) -> [u8; 4] {
    match components {
        3 => [src[0], src[1], src[2], 0xff],
        _ => [src[0], src[1], src[2], src[3]],
    }
}

fn write_rgba(dst: &mut [u8], components: usize, pixel: [u8; 4]) {
    dst[..components].copy_from_slice(&pixel[..components]);
}

fn row_stride(width: u32, components: usize, alignment: u32) -> usize {
    let bytes = width as usize * components;
    let alignment = alignment.max(1) as usize;
    bytes.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone)]
struct Texture {
    storage: Option<u32>,
    min_filter: Filter,
    mag_filter: Filter,
    wrap_s: Wrap,
    wrap_t: Wrap,
}

impl Default for Texture {
    fn default() -> Self {
        Self {
            storage: None,
            min_filter: Filter::Nearest,
            mag_filter: Filter::Linear,
            wrap_s: Wrap::Repeat,
            wrap_t: Wrap::Repeat,
        }
    }
}

#[derive(Debug, Clone)]
struct Shader {
    kind: ShaderKind,
    source: String,
    compiled: bool,
}

#[derive(Debug, Clone, Default)]
struct Program {
    shaders: Vec<ShaderId>,
    linked: bool,
    log: String,
    attributes: Vec<String>,
    /// (type, name)
    uniforms: Vec<(String, String)>,
    uniform_values: HashMap<i32, i32>,
}

#[derive(Clone)]
struct Surface {
    storage: u32,
    window: Option<Arc<dyn NativeWindow>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Attrib {
    enabled: bool,
    buffer: BufferId,
    size: u32,
    stride: u32,
    offset: usize,
}

#[derive(Debug, Clone)]
struct GlState {
    units: [TextureId; MAX_TEXTURE_UNITS],
    active_unit: usize,
    framebuffer: FramebufferId,
    viewport: Option<Viewport>,
    clear_color: [f32; 4],
    program: ProgramId,
    array_buffer: BufferId,
    element_buffer: BufferId,
    attribs: HashMap<i32, Attrib>,
    unpack_alignment: u32,
    errors: VecDeque<GlError>,
}

impl Default for GlState {
    fn default() -> Self {
        Self {
            units: [TextureId::NULL; MAX_TEXTURE_UNITS],
            active_unit: 0,
            framebuffer: FramebufferId::NULL,
            viewport: None,
            clear_color: [0.0; 4],
            program: ProgramId::NULL,
            array_buffer: BufferId::NULL,
            element_buffer: BufferId::NULL,
            attribs: HashMap::new(),
            unpack_alignment: DEFAULT_UNPACK_ALIGNMENT,
            errors: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Vertex {
    x: f32,
    y: f32,
    u: f32,
    v: f32,
}

#[derive(Default)]
struct State {
    next_name: u32,
    storages: HashMap<u32, Storage>,
    textures: HashMap<TextureId, Texture>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    images: HashMap<ImageId, u32>,
    buffers: HashMap<BufferId, Vec<u8>>,
    shaders: HashMap<ShaderId, Shader>,
    programs: HashMap<ProgramId, Program>,
    contexts: HashMap<ContextId, GlState>,
    surfaces: HashMap<SurfaceId, Surface>,
    bindings: HashMap<ThreadId, Binding>,
    context_loss: bool,
    image_failure: bool,
    incomplete_framebuffers: bool,
}

impl State {
    fn name(&mut self) -> u32 {
        self.next_name += 1;
        self.next_name
    }

    fn new_storage(&mut self, width: u32, height: u32, format: PixelFormat) -> u32 {
        let id = self.name();
        self.storages.insert(id, Storage::new(width, height, format));
        id
    }

    fn retain(&mut self, storage: u32) {
        if let Some(s) = self.storages.get_mut(&storage) {
            s.refs += 1;
        }
    }

    fn release(&mut self, storage: u32) {
        if let Some(s) = self.storages.get_mut(&storage) {
            s.refs -= 1;
            if s.refs == 0 {
                self.storages.remove(&storage);
            }
        }
    }

    fn binding(&self) -> Binding {
        self.bindings
            .get(&thread::current().id())
            .copied()
            .unwrap_or(Binding::NONE)
    }

    fn gl(&mut self) -> Option<&mut GlState> {
        let context = self.binding().context;
        self.contexts.get_mut(&context)
    }

    fn error(&mut self, error: GlError) {
        if let Some(gl) = self.gl() {
            gl.errors.push_back(error);
        }
    }

    fn bound_texture(&mut self) -> Option<TextureId> {
        let gl = self.gl()?;
        let texture = gl.units[gl.active_unit];
        (!texture.is_null()).then_some(texture)
    }

    fn framebuffer_status(&self, framebuffer: FramebufferId) -> FramebufferStatus {
        if self.incomplete_framebuffers {
            return FramebufferStatus::Unsupported;
        }
        match self.framebuffers.get(&framebuffer) {
            None => FramebufferStatus::Unsupported,
            Some(texture) if texture.is_null() => FramebufferStatus::MissingAttachment,
            Some(texture) => match self.textures.get(texture).and_then(|t| t.storage) {
                Some(_) => FramebufferStatus::Complete,
                None => FramebufferStatus::IncompleteAttachment,
            },
        }
    }

    fn framebuffer_storage(&self, framebuffer: FramebufferId) -> Option<u32> {
        if self.framebuffer_status(framebuffer) != FramebufferStatus::Complete {
            return None;
        }
        let texture = self.framebuffers.get(&framebuffer)?;
        self.textures.get(texture)?.storage
    }

    /// Storage reads come from: bound framebuffer, else the read surface
    fn read_target(&mut self) -> Option<u32> {
        let binding = self.binding();
        let framebuffer = self.gl()?.framebuffer;
        if framebuffer.is_null() {
            self.surfaces.get(&binding.read).map(|s| s.storage)
        } else {
            self.framebuffer_storage(framebuffer)
        }
    }

    /// Storage draws go to: bound framebuffer, else the draw surface
    fn draw_target(&mut self) -> Option<u32> {
        let binding = self.binding();
        let framebuffer = self.gl()?.framebuffer;
        if framebuffer.is_null() {
            self.surfaces.get(&binding.draw).map(|s| s.storage)
        } else {
            self.framebuffer_storage(framebuffer)
        }
    }

    fn unbind_texture_everywhere(&mut self, texture: TextureId) {
        for gl in self.contexts.values_mut() {
            for unit in gl.units.iter_mut() {
                if *unit == texture {
                    *unit = TextureId::NULL;
                }
            }
        }
    }

    fn vertex(&self, gl: &GlState, index: u8) -> Option<Vertex> {
        let fetch = |slot: i32| -> Option<Vec<f32>> {
            let attrib = gl.attribs.get(&slot).filter(|a| a.enabled)?;
            let data = self.buffers.get(&attrib.buffer)?;
            let stride = if attrib.stride == 0 {
                attrib.size as usize * 4
            } else {
                attrib.stride as usize
            };
            let start = attrib.offset + index as usize * stride;
            (0..attrib.size as usize)
                .map(|c| {
                    let at = start + c * 4;
                    let bytes = data.get(at..at + 4)?;
                    Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                })
                .collect()
        };
        let position = fetch(0)?;
        let coord = fetch(1)?;
        Some(Vertex {
            x: *position.first()?,
            y: *position.get(1)?,
            u: *coord.first()?,
            v: *coord.get(1)?,
        })
    }
}

fn declarations(source: &str, qualifier: &str) -> Vec<(String, String)> {
    source
        .split([';', '\n'])
        .filter_map(|statement| {
            let tokens: Vec<&str> = statement.split_whitespace().collect();
            if tokens.len() < 3 || tokens[0] != qualifier {
                return None;
            }
            let name = tokens[tokens.len() - 1];
            let name = name.split('[').next().unwrap_or(name);
            Some((tokens[tokens.len() - 2].to_string(), name.to_string()))
        })
        .collect()
}

fn compiles(source: &str) -> bool {
    if !source.contains("void main") || source.contains("#error") {
        return false;
    }
    let mut depth = 0i32;
    for c in source.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn edge(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

fn rasterize(
    target: &mut Storage,
    viewport: Viewport,
    triangle: [Vertex; 3],
    source: &Storage,
    wrap: (Wrap, Wrap),
) {
    let to_window = |v: &Vertex| {
        (
            viewport.x as f32 + (v.x + 1.0) * 0.5 * viewport.width as f32,
            viewport.y as f32 + (v.y + 1.0) * 0.5 * viewport.height as f32,
        )
    };
    let p = [
        to_window(&triangle[0]),
        to_window(&triangle[1]),
        to_window(&triangle[2]),
    ];
    let area = edge(p[0], p[1], p[2]);
    if area.abs() < EDGE_EPSILON {
        return;
    }

    let min_x = p.iter().map(|q| q.0).fold(f32::MAX, f32::min).floor() as i64;
    let max_x = p.iter().map(|q| q.0).fold(f32::MIN, f32::max).ceil() as i64;
    let min_y = p.iter().map(|q| q.1).fold(f32::MAX, f32::min).floor() as i64;
    let max_y = p.iter().map(|q| q.1).fold(f32::MIN, f32::max).ceil() as i64;

    let x0 = min_x.max(i64::from(viewport.x)).max(0);
    let x1 = max_x
        .min(i64::from(viewport.x) + i64::from(viewport.width))
        .min(i64::from(target.width));
    let y0 = min_y.max(i64::from(viewport.y)).max(0);
    let y1 = max_y
        .min(i64::from(viewport.y) + i64::from(viewport.height))
        .min(i64::from(target.height));

    for py in y0..y1 {
        for px in x0..x1 {
            let center = (px as f32 + 0.5, py as f32 + 0.5);
            let w0 = edge(p[1], p[2], center) / area;
            let w1 = edge(p[2], p[0], center) / area;
            let w2 = edge(p[0], p[1], center) / area;
            if w0 < -EDGE_EPSILON || w1 < -EDGE_EPSILON || w2 < -EDGE_EPSILON {
                continue;
            }
            let u = w0 * triangle[0].u + w1 * triangle[1].u + w2 * triangle[2].u;
            let v = w0 * triangle[0].v + w1 * triangle[1].v + w2 * triangle[2].v;
            target.put(px as u32, py as u32, source.sample(u, v, wrap));
        }
    }
}

/// In-memory GLES driver
#[derive(Default)]
pub struct SoftwareDriver {
    state: Mutex<State>,
    calls: AtomicU64,
}

impl SoftwareDriver {
    /// Create a driver with no objects
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counted entry point for driver calls
    fn call(&self) -> MutexGuard<'_, State> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.state()
    }

    /// Number of driver calls issued so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Live object counts
    pub fn objects(&self) -> ObjectCounts {
        let state = self.state();
        ObjectCounts {
            textures: state.textures.len(),
            framebuffers: state.framebuffers.len(),
            images: state.images.len(),
            buffers: state.buffers.len(),
            shaders: state.shaders.len(),
            programs: state.programs.len(),
            contexts: state.contexts.len(),
            surfaces: state.surfaces.len(),
        }
    }

    /// Make every subsequent `make_current` fail
    pub fn set_context_loss(&self, lost: bool) {
        self.state().context_loss = lost;
    }

    /// Make every subsequent `create_image` fail
    pub fn set_image_failure(&self, fail: bool) {
        self.state().image_failure = fail;
    }

    /// Report every framebuffer as incomplete
    pub fn set_incomplete_framebuffers(&self, incomplete: bool) {
        self.state().incomplete_framebuffers = incomplete;
    }

    /// Contents of a surface, bottom row first
    pub fn surface_pixels(&self, surface: SurfaceId) -> Option<Vec<u8>> {
        let state = self.state();
        let storage = state.surfaces.get(&surface)?.storage;
        state.storages.get(&storage).map(|s| s.data.clone())
    }

    /// Contents of a texture, in its own format, bottom row first
    pub fn texture_pixels(&self, texture: TextureId) -> Option<Vec<u8>> {
        let state = self.state();
        let storage = state.textures.get(&texture)?.storage?;
        state.storages.get(&storage).map(|s| s.data.clone())
    }
}

impl GlesDriver for SoftwareDriver {
    fn create_context(&self, share: ContextId) -> ContextId {
        let mut state = self.call();
        if !share.is_null() && !state.contexts.contains_key(&share) {
            return ContextId::NULL;
        }
        let id = ContextId(state.name());
        state.contexts.insert(id, GlState::default());
        id
    }

    fn destroy_context(&self, context: ContextId) {
        let mut state = self.call();
        state.contexts.remove(&context);
        state.bindings.retain(|_, b| b.context != context);
    }

    fn create_pbuffer_surface(&self, width: u32, height: u32) -> SurfaceId {
        let mut state = self.call();
        if !valid_image_size(width, height) {
            return SurfaceId::NULL;
        }
        let storage = state.new_storage(width, height, PixelFormat::Rgba);
        let id = SurfaceId(state.name());
        state.surfaces.insert(
            id,
            Surface {
                storage,
                window: None,
            },
        );
        id
    }

    fn create_window_surface(&self, window: Arc<dyn NativeWindow>) -> SurfaceId {
        let mut state = self.call();
        let (width, height) = window.size();
        if !valid_image_size(width, height) {
            return SurfaceId::NULL;
        }
        let storage = state.new_storage(width, height, PixelFormat::Rgba);
        let id = SurfaceId(state.name());
        state.surfaces.insert(
            id,
            Surface {
                storage,
                window: Some(window),
            },
        );
        id
    }

    fn destroy_surface(&self, surface: SurfaceId) {
        let mut state = self.call();
        if let Some(s) = state.surfaces.remove(&surface) {
            state.release(s.storage);
        }
    }

    fn make_current(&self, binding: Binding) -> bool {
        let mut state = self.call();
        if state.context_loss {
            return false;
        }
        let me = thread::current().id();
        if binding.context.is_null() {
            state.bindings.remove(&me);
            return true;
        }
        let busy = state
            .bindings
            .iter()
            .any(|(thread, b)| *thread != me && b.context == binding.context);
        if busy {
            debug!("context {} is current on another thread", binding.context);
            return false;
        }
        let Some(draw) = state.surfaces.get(&binding.draw).map(|s| s.storage) else {
            return false;
        };
        if !state.surfaces.contains_key(&binding.read) {
            return false;
        }
        let (width, height) = match state.storages.get(&draw) {
            Some(s) => (s.width as i32, s.height as i32),
            None => return false,
        };
        let Some(gl) = state.contexts.get_mut(&binding.context) else {
            return false;
        };
        if gl.viewport.is_none() {
            gl.viewport = Some(Viewport::new(0, 0, width, height));
        }
        state.bindings.insert(me, binding);
        true
    }

    fn current_binding(&self) -> Binding {
        self.call().binding()
    }

    fn swap_buffers(&self, surface: SurfaceId) -> bool {
        let (window, frame) = {
            let state = self.call();
            let Some(s) = state.surfaces.get(&surface) else {
                return false;
            };
            let Some(window) = s.window.clone() else {
                // pbuffers have nothing to present
                return true;
            };
            let Some(storage) = state.storages.get(&s.storage) else {
                return false;
            };
            let row = storage.width as usize * 4;
            let mut pixels = Vec::with_capacity(storage.data.len());
            for y in (0..storage.height as usize).rev() {
                pixels.extend_from_slice(&storage.data[y * row..(y + 1) * row]);
            }
            let frame = Frame {
                width: storage.width,
                height: storage.height,
                pixels,
            };
            (window, frame)
        };
        window.present(&frame);
        true
    }

    fn create_image(&self, context: ContextId, texture: TextureId) -> ImageId {
        let mut state = self.call();
        if state.image_failure || !state.contexts.contains_key(&context) {
            return ImageId::NULL;
        }
        let Some(storage) = state.textures.get(&texture).and_then(|t| t.storage) else {
            return ImageId::NULL;
        };
        state.retain(storage);
        let id = ImageId(state.name());
        state.images.insert(id, storage);
        id
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.call();
        if let Some(storage) = state.images.remove(&image) {
            state.release(storage);
        }
    }

    fn image_target_texture_2d(&self, image: ImageId) {
        let mut state = self.call();
        let Some(storage) = state.images.get(&image).copied() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(texture) = state.bound_texture() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        state.retain(storage);
        let previous = state
            .textures
            .get_mut(&texture)
            .and_then(|t| t.storage.replace(storage));
        if let Some(previous) = previous {
            state.release(previous);
        }
    }

    fn image_target_renderbuffer_storage(&self, image: ImageId) {
        let mut state = self.call();
        if !state.images.contains_key(&image) {
            state.error(GlError::InvalidOperation);
        }
    }

    fn gen_texture(&self) -> TextureId {
        let mut state = self.call();
        if state.gl().is_none() {
            return TextureId::NULL;
        }
        let id = TextureId(state.name());
        state.textures.insert(id, Texture::default());
        id
    }

    fn delete_textures(&self, textures: &[TextureId]) {
        let mut state = self.call();
        for texture in textures.iter().filter(|t| !t.is_null()) {
            if let Some(t) = state.textures.remove(texture) {
                if let Some(storage) = t.storage {
                    state.release(storage);
                }
                state.unbind_texture_everywhere(*texture);
            }
        }
    }

    fn bind_texture(&self, texture: TextureId) {
        let mut state = self.call();
        if !texture.is_null() && !state.textures.contains_key(&texture) {
            state.error(GlError::InvalidOperation);
            return;
        }
        if let Some(gl) = state.gl() {
            let unit = gl.active_unit;
            gl.units[unit] = texture;
        }
    }

    fn texture_binding(&self) -> TextureId {
        let mut state = self.call();
        state.bound_texture().unwrap_or_default()
    }

    fn active_texture(&self, unit: u32) {
        let mut state = self.call();
        if unit as usize >= MAX_TEXTURE_UNITS {
            state.error(GlError::InvalidEnum);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.active_unit = unit as usize;
        }
    }

    fn tex_image_2d(
        &self,
        internal: PixelFormat,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        pixels: Option<&[u8]>,
    ) {
        let mut state = self.call();
        if PixelFormat::try_from(format) != Ok(internal) || PixelType::try_from(ty).is_err() {
            state.error(GlError::InvalidOperation);
            return;
        }
        if width > MAX_TEXTURE_SIZE || height > MAX_TEXTURE_SIZE {
            state.error(GlError::InvalidValue);
            return;
        }
        let Some(texture) = state.bound_texture() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let alignment = state.gl().map_or(DEFAULT_UNPACK_ALIGNMENT, |gl| gl.unpack_alignment);
        let mut storage = Storage::new(width, height, internal);
        if let Some(pixels) = pixels {
            let components = internal.components();
            let stride = row_stride(width, components, alignment);
            let tight = width as usize * components;
            let needed = if height == 0 {
                0
            } else {
                stride * (height as usize - 1) + tight
            };
            if pixels.len() < needed {
                state.error(GlError::InvalidValue);
                return;
            }
            for row in 0..height as usize {
                storage.data[row * tight..(row + 1) * tight]
                    .copy_from_slice(&pixels[row * stride..row * stride + tight]);
            }
        }
        let id = state.name();
        state.storages.insert(id, storage);
        let previous = state
            .textures
            .get_mut(&texture)
            .and_then(|t| t.storage.replace(id));
        if let Some(previous) = previous {
            state.release(previous);
        }
    }

    fn tex_sub_image_2d(
        &self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        pixels: &[u8],
    ) {
        let mut state = self.call();
        let (Ok(format), Ok(_)) = (PixelFormat::try_from(format), PixelType::try_from(ty)) else {
            state.error(GlError::InvalidEnum);
            return;
        };
        let Some(storage_id) = state
            .bound_texture()
            .and_then(|t| state.textures.get(&t))
            .and_then(|t| t.storage)
        else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let alignment = state.gl().map_or(DEFAULT_UNPACK_ALIGNMENT, |gl| gl.unpack_alignment);
        let Some(storage) = state.storages.get_mut(&storage_id) else {
            return;
        };
        let fits = x >= 0
            && y >= 0
            && x as u64 + u64::from(width) <= u64::from(storage.width)
            && y as u64 + u64::from(height) <= u64::from(storage.height);
        let components = format.components();
        let stride = row_stride(width, components, alignment);
        let needed = if height == 0 {
            0
        } else {
            stride * (height as usize - 1) + width as usize * components
        };
        if !fits || pixels.len() < needed {
            state.error(GlError::InvalidValue);
            return;
        }
        for row in 0..height {
            for col in 0..width {
                let src = row as usize * stride + col as usize * components;
                let pixel = read_rgba(&pixels[src..], components);
                storage.put(x as u32 + col, y as u32 + row, pixel);
            }
        }
    }

    fn tex_parameter(&self, param: TexParam) {
        let mut state = self.call();
        let Some(texture) = state.bound_texture() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        if let Some(t) = state.textures.get_mut(&texture) {
            match param {
                TexParam::MinFilter(f) => t.min_filter = f,
                TexParam::MagFilter(f) => t.mag_filter = f,
                TexParam::WrapS(w) => t.wrap_s = w,
                TexParam::WrapT(w) => t.wrap_t = w,
            }
        }
    }

    fn pixel_store_unpack_alignment(&self, alignment: u32) {
        let mut state = self.call();
        if !matches!(alignment, 1 | 2 | 4 | 8) {
            state.error(GlError::InvalidValue);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.unpack_alignment = alignment;
        }
    }

    fn copy_tex_sub_image_2d(
        &self,
        xoffset: i32,
        yoffset: i32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) {
        let mut state = self.call();
        let Some(source_id) = state.read_target() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(dest_id) = state
            .bound_texture()
            .and_then(|t| state.textures.get(&t))
            .and_then(|t| t.storage)
        else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(source) = state.storages.get(&source_id).cloned() else {
            return;
        };
        let Some(dest) = state.storages.get_mut(&dest_id) else {
            return;
        };
        for row in 0..height as i64 {
            for col in 0..width as i64 {
                let (sx, sy) = (i64::from(x) + col, i64::from(y) + row);
                let (dx, dy) = (i64::from(xoffset) + col, i64::from(yoffset) + row);
                let inside_source = sx >= 0
                    && sy >= 0
                    && sx < i64::from(source.width)
                    && sy < i64::from(source.height);
                let inside_dest =
                    dx >= 0 && dy >= 0 && dx < i64::from(dest.width) && dy < i64::from(dest.height);
                if inside_source && inside_dest {
                    dest.put(dx as u32, dy as u32, source.texel(sx as u32, sy as u32));
                }
            }
        }
    }

    fn gen_framebuffer(&self) -> FramebufferId {
        let mut state = self.call();
        if state.gl().is_none() {
            return FramebufferId::NULL;
        }
        let id = FramebufferId(state.name());
        state.framebuffers.insert(id, TextureId::NULL);
        id
    }

    fn delete_framebuffers(&self, framebuffers: &[FramebufferId]) {
        let mut state = self.call();
        for framebuffer in framebuffers {
            if state.framebuffers.remove(framebuffer).is_some() {
                for gl in state.contexts.values_mut() {
                    if gl.framebuffer == *framebuffer {
                        gl.framebuffer = FramebufferId::NULL;
                    }
                }
            }
        }
    }

    fn bind_framebuffer(&self, framebuffer: FramebufferId) {
        let mut state = self.call();
        if !framebuffer.is_null() && !state.framebuffers.contains_key(&framebuffer) {
            state.error(GlError::InvalidOperation);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.framebuffer = framebuffer;
        }
    }

    fn framebuffer_texture_2d(&self, texture: TextureId) {
        let mut state = self.call();
        let Some(framebuffer) = state.gl().map(|gl| gl.framebuffer) else {
            return;
        };
        if framebuffer.is_null() || (!texture.is_null() && !state.textures.contains_key(&texture)) {
            state.error(GlError::InvalidOperation);
            return;
        }
        state.framebuffers.insert(framebuffer, texture);
    }

    fn check_framebuffer_status(&self) -> FramebufferStatus {
        let mut state = self.call();
        let Some(framebuffer) = state.gl().map(|gl| gl.framebuffer) else {
            return FramebufferStatus::Unsupported;
        };
        if framebuffer.is_null() {
            // the default framebuffer is always complete
            return FramebufferStatus::Complete;
        }
        state.framebuffer_status(framebuffer)
    }

    fn read_pixels(
        &self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        out: &mut [u8],
    ) {
        let mut state = self.call();
        let (Ok(format), Ok(_)) = (PixelFormat::try_from(format), PixelType::try_from(ty)) else {
            state.error(GlError::InvalidEnum);
            return;
        };
        let components = format.components();
        if out.len() < width as usize * height as usize * components {
            state.error(GlError::InvalidValue);
            return;
        }
        let Some(source_id) = state.read_target() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(source) = state.storages.get(&source_id) else {
            return;
        };
        for row in 0..height as i64 {
            for col in 0..width as i64 {
                let (sx, sy) = (i64::from(x) + col, i64::from(y) + row);
                if sx < 0 || sy < 0 || sx >= i64::from(source.width) || sy >= i64::from(source.height)
                {
                    continue;
                }
                let dst = (row as usize * width as usize + col as usize) * components;
                write_rgba(&mut out[dst..], components, source.texel(sx as u32, sy as u32));
            }
        }
    }

    fn viewport(&self, viewport: Viewport) {
        let mut state = self.call();
        if viewport.width < 0 || viewport.height < 0 {
            state.error(GlError::InvalidValue);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.viewport = Some(viewport);
        }
    }

    fn get_viewport(&self) -> Viewport {
        let mut state = self.call();
        state.gl().and_then(|gl| gl.viewport).unwrap_or_default()
    }

    fn clear_color(&self, r: f32, g: f32, b: f32, a: f32) {
        let mut state = self.call();
        if let Some(gl) = state.gl() {
            gl.clear_color = [r, g, b, a];
        }
    }

    fn clear(&self) {
        let mut state = self.call();
        let Some(color) = state.gl().map(|gl| gl.clear_color) else {
            return;
        };
        let Some(target) = state.draw_target() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let pixel = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        if let Some(storage) = state.storages.get_mut(&target) {
            for y in 0..storage.height {
                for x in 0..storage.width {
                    storage.put(x, y, pixel);
                }
            }
        }
    }

    fn create_shader(&self, kind: ShaderKind) -> ShaderId {
        let mut state = self.call();
        if state.gl().is_none() {
            return ShaderId::NULL;
        }
        let id = ShaderId(state.name());
        state.shaders.insert(
            id,
            Shader {
                kind,
                source: String::new(),
                compiled: false,
            },
        );
        id
    }

    fn shader_source(&self, shader: ShaderId, source: &str) {
        let mut state = self.call();
        match state.shaders.get_mut(&shader) {
            Some(s) => s.source = source.to_string(),
            None => state.error(GlError::InvalidValue),
        }
    }

    fn compile_shader(&self, shader: ShaderId) -> bool {
        let mut state = self.call();
        match state.shaders.get_mut(&shader) {
            Some(s) => {
                s.compiled = compiles(&s.source);
                s.compiled
            }
            None => false,
        }
    }

    fn delete_shader(&self, shader: ShaderId) {
        self.call().shaders.remove(&shader);
    }

    fn create_program(&self) -> ProgramId {
        let mut state = self.call();
        if state.gl().is_none() {
            return ProgramId::NULL;
        }
        let id = ProgramId(state.name());
        state.programs.insert(id, Program::default());
        id
    }

    fn attach_shader(&self, program: ProgramId, shader: ShaderId) {
        let mut state = self.call();
        if !state.shaders.contains_key(&shader) {
            state.error(GlError::InvalidValue);
            return;
        }
        match state.programs.get_mut(&program) {
            Some(p) => p.shaders.push(shader),
            None => state.error(GlError::InvalidValue),
        }
    }

    fn link_program(&self, program: ProgramId) -> bool {
        let mut state = self.call();
        let Some(attached) = state.programs.get(&program).map(|p| p.shaders.clone()) else {
            return false;
        };
        let shaders: Vec<Shader> = attached
            .iter()
            .filter_map(|id| state.shaders.get(id).cloned())
            .collect();
        let stage = |kind: ShaderKind| shaders.iter().filter(|s| s.kind == kind).count();

        let failure = if shaders.len() != attached.len() {
            Some("attached shader was deleted".to_string())
        } else if stage(ShaderKind::Vertex) != 1 || stage(ShaderKind::Fragment) != 1 {
            Some("need exactly one vertex and one fragment shader".to_string())
        } else if shaders.iter().any(|s| !s.compiled) {
            Some("attached shader is not compiled".to_string())
        } else {
            None
        };

        let mut attributes = Vec::new();
        let mut uniforms: Vec<(String, String)> = Vec::new();
        if failure.is_none() {
            for shader in &shaders {
                if shader.kind == ShaderKind::Vertex {
                    attributes.extend(
                        declarations(&shader.source, "attribute")
                            .into_iter()
                            .map(|(_, name)| name),
                    );
                }
                for uniform in declarations(&shader.source, "uniform") {
                    if !uniforms.iter().any(|(_, name)| *name == uniform.1) {
                        uniforms.push(uniform);
                    }
                }
            }
        }

        let Some(p) = state.programs.get_mut(&program) else {
            return false;
        };
        p.linked = failure.is_none();
        p.log = failure.unwrap_or_default();
        p.attributes = attributes;
        p.uniforms = uniforms;
        p.uniform_values.clear();
        p.linked
    }

    fn validate_program(&self, program: ProgramId) -> bool {
        let state = self.call();
        let Some(p) = state.programs.get(&program) else {
            return false;
        };
        p.linked
            && p
                .uniform_values
                .values()
                .all(|unit| (0..MAX_TEXTURE_UNITS as i32).contains(unit))
    }

    fn program_info_log(&self, program: ProgramId) -> String {
        let state = self.call();
        state
            .programs
            .get(&program)
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    fn use_program(&self, program: ProgramId) {
        let mut state = self.call();
        let linked = program.is_null() || state.programs.get(&program).is_some_and(|p| p.linked);
        if !linked {
            state.error(GlError::InvalidOperation);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.program = program;
        }
    }

    fn delete_program(&self, program: ProgramId) {
        let mut state = self.call();
        state.programs.remove(&program);
        for gl in state.contexts.values_mut() {
            if gl.program == program {
                gl.program = ProgramId::NULL;
            }
        }
    }

    fn attrib_location(&self, program: ProgramId, name: &str) -> i32 {
        let state = self.call();
        state
            .programs
            .get(&program)
            .filter(|p| p.linked)
            .and_then(|p| p.attributes.iter().position(|a| a == name))
            .map_or(-1, |slot| slot as i32)
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> i32 {
        let state = self.call();
        state
            .programs
            .get(&program)
            .filter(|p| p.linked)
            .and_then(|p| p.uniforms.iter().position(|(_, u)| u == name))
            .map_or(-1, |slot| slot as i32)
    }

    fn uniform_1i(&self, location: i32, value: i32) {
        let mut state = self.call();
        if location < 0 {
            return;
        }
        let Some(program) = state.gl().map(|gl| gl.program) else {
            return;
        };
        match state.programs.get_mut(&program) {
            Some(p) => {
                p.uniform_values.insert(location, value);
            }
            None => state.error(GlError::InvalidOperation),
        }
    }

    fn gen_buffer(&self) -> BufferId {
        let mut state = self.call();
        if state.gl().is_none() {
            return BufferId::NULL;
        }
        let id = BufferId(state.name());
        state.buffers.insert(id, Vec::new());
        id
    }

    fn delete_buffers(&self, buffers: &[BufferId]) {
        let mut state = self.call();
        for buffer in buffers {
            state.buffers.remove(buffer);
        }
    }

    fn bind_buffer(&self, target: BufferTarget, buffer: BufferId) {
        let mut state = self.call();
        if !buffer.is_null() && !state.buffers.contains_key(&buffer) {
            state.error(GlError::InvalidOperation);
            return;
        }
        if let Some(gl) = state.gl() {
            match target {
                BufferTarget::Array => gl.array_buffer = buffer,
                BufferTarget::ElementArray => gl.element_buffer = buffer,
            }
        }
    }

    fn buffer_data(&self, target: BufferTarget, data: &[u8]) {
        let mut state = self.call();
        let Some(buffer) = state.gl().map(|gl| match target {
            BufferTarget::Array => gl.array_buffer,
            BufferTarget::ElementArray => gl.element_buffer,
        }) else {
            return;
        };
        match state.buffers.get_mut(&buffer) {
            Some(b) => *b = data.to_vec(),
            None => state.error(GlError::InvalidOperation),
        }
    }

    fn enable_vertex_attrib_array(&self, slot: i32) {
        let mut state = self.call();
        if slot < 0 {
            state.error(GlError::InvalidValue);
            return;
        }
        if let Some(gl) = state.gl() {
            gl.attribs.entry(slot).or_default().enabled = true;
        }
    }

    fn vertex_attrib_pointer(&self, slot: i32, size: u32, stride: u32, offset: usize) {
        let mut state = self.call();
        if slot < 0 || !(1..=4).contains(&size) {
            state.error(GlError::InvalidValue);
            return;
        }
        if let Some(gl) = state.gl() {
            let buffer = gl.array_buffer;
            let attrib = gl.attribs.entry(slot).or_default();
            attrib.buffer = buffer;
            attrib.size = size;
            attrib.stride = stride;
            attrib.offset = offset;
        }
    }

    fn draw_elements(&self, count: u32) {
        let mut state = self.call();
        let Some(gl) = state.gl().cloned() else {
            return;
        };
        let Some(program) = state.programs.get(&gl.program).filter(|p| p.linked).cloned() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(indices) = state.buffers.get(&gl.element_buffer).cloned() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        if indices.len() < count as usize {
            state.error(GlError::InvalidOperation);
            return;
        }
        let unit = program
            .uniforms
            .iter()
            .position(|(ty, _)| ty.starts_with("sampler"))
            .and_then(|slot| program.uniform_values.get(&(slot as i32)).copied())
            .unwrap_or(0)
            .clamp(0, MAX_TEXTURE_UNITS as i32 - 1) as usize;
        let Some(texture) = state.textures.get(&gl.units[unit]).cloned() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(source) = texture.storage.and_then(|s| state.storages.get(&s)).cloned() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let Some(target_id) = state.draw_target() else {
            state.error(GlError::InvalidOperation);
            return;
        };
        let mut triangles = Vec::new();
        for chunk in indices[..count as usize].chunks_exact(3) {
            let vertices: Option<Vec<Vertex>> =
                chunk.iter().map(|&i| state.vertex(&gl, i)).collect();
            match vertices {
                Some(v) => triangles.push([v[0], v[1], v[2]]),
                None => {
                    state.error(GlError::InvalidOperation);
                    return;
                }
            }
        }
        let viewport = gl.viewport.unwrap_or_default();
        let wrap = (texture.wrap_s, texture.wrap_t);
        if let Some(target) = state.storages.get_mut(&target_id) {
            for triangle in triangles {
                rasterize(target, viewport, triangle, &source, wrap);
            }
        }
    }

    fn get_error(&self) -> Option<GlError> {
        let mut state = self.call();
        state.gl().and_then(|gl| gl.errors.pop_front())
    }
}
