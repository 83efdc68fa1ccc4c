// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Renderer
//!
//! Owns the host context, the texture compositor and every guest-visible
//! object: color buffers, guest contexts and guest surfaces. Guests address
//! them by opaque non-zero handles; nothing driver-level leaves this module.
//!
//! Lock order: host context, then a color buffer's own state, then the
//! registries here. Registry locks are never held across GPU work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;

use crate::color_buffer::{ColorBuffer, ColorBufferError, ColorBufferHelper};
use crate::context::{ContextBinder, HostContext, ScopedContext};
use crate::gles::format::GL_RGBA;
use crate::gles::{
    valid_image_size, Binding, ContextId, FramebufferId, GlesDriver, NativeWindow, Rect, SurfaceId,
};
use crate::layer_composer::Renderable;
use crate::texture_draw::TextureDraw;

/// Handles tried before giving up once the counter has wrapped
const HANDLE_ATTEMPTS: u32 = 1024;

/// Errors from renderer object management
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RendererError {
    /// The host context could not be created
    #[error("failed to create host context")]
    HostContext,

    #[error(transparent)]
    ColorBuffer(#[from] ColorBufferError),

    /// No object is registered under this handle
    #[error("unknown handle {0}")]
    UnknownHandle(u32),

    /// The driver refused to create the object
    #[error("driver failed to create {0}")]
    Driver(&'static str),

    /// Zero-sized or larger than `MAX_TEXTURE_SIZE`
    #[error("invalid surface size {0}x{1}")]
    InvalidSize(u32, u32),

    /// No free handle was found
    #[error("out of handles")]
    HandlesExhausted,
}

pub type Result<T> = std::result::Result<T, RendererError>;

/// Display the renderer composes for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub xdpi: u32,
    pub ydpi: u32,
    pub refresh_rate: u32,
}

impl Default for DisplayInfo {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            xdpi: 160,
            ydpi: 160,
            refresh_rate: 60,
        }
    }
}

/// Framebuffer parameters guests may query
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbParam {
    Width = 1,
    Height = 2,
    XDpi = 3,
    YDpi = 4,
    Fps = 5,
    Format = 6,
    MinSwapInterval = 7,
    MaxSwapInterval = 8,
}

impl TryFrom<u32> for FbParam {
    type Error = &'static str;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(FbParam::Width),
            2 => Ok(FbParam::Height),
            3 => Ok(FbParam::XDpi),
            4 => Ok(FbParam::YDpi),
            5 => Ok(FbParam::Fps),
            6 => Ok(FbParam::Format),
            7 => Ok(FbParam::MinSwapInterval),
            8 => Ok(FbParam::MaxSwapInterval),
            _ => Err("Unknown framebuffer parameter"),
        }
    }
}

/// Renderer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub color_buffers: usize,
    pub contexts: usize,
    pub surfaces: usize,
    pub frames: u64,
}

/// Context and compositor shared by every color buffer
pub struct RenderHelper {
    host: Arc<HostContext>,
    draw: TextureDraw,
    display: (u32, u32),
}

impl RenderHelper {
    /// Create the host context and its compositor
    pub fn new(driver: Arc<dyn GlesDriver>, display: (u32, u32)) -> Option<Self> {
        let host = Arc::new(HostContext::new(Arc::clone(&driver))?);
        let draw = TextureDraw::new(driver, host.clone());
        if !draw.is_enabled() {
            warn!("composition disabled: texture compositor failed to build");
        }
        Some(Self {
            host,
            draw,
            display,
        })
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }
}

impl ContextBinder for RenderHelper {
    fn setup_context(&self) -> bool {
        self.host.setup_context()
    }

    fn teardown_context(&self) {
        self.host.teardown_context();
    }
}

impl ColorBufferHelper for RenderHelper {
    fn texture_draw(&self) -> &TextureDraw {
        &self.draw
    }

    fn display_size(&self) -> (u32, u32) {
        self.display
    }
}

struct Entry {
    buffer: Arc<ColorBuffer>,
    refs: u32,
}

pub struct Renderer {
    driver: Arc<dyn GlesDriver>,
    helper: Arc<RenderHelper>,
    display: DisplayInfo,
    next_handle: AtomicU32,
    buffers: Mutex<HashMap<u32, Entry>>,
    contexts: Mutex<HashMap<u32, ContextId>>,
    surfaces: Mutex<HashMap<u32, SurfaceId>>,
    windows: Mutex<HashMap<u64, SurfaceId>>,
    frames: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Renderer {
    pub fn new(driver: Arc<dyn GlesDriver>, display: DisplayInfo) -> Result<Self> {
        let helper = RenderHelper::new(Arc::clone(&driver), (display.width, display.height))
            .ok_or(RendererError::HostContext)?;
        info!(
            "renderer ready: {}x{} @ {} Hz",
            display.width, display.height, display.refresh_rate
        );
        Ok(Self {
            driver,
            helper: Arc::new(helper),
            display,
            next_handle: AtomicU32::new(1),
            buffers: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            surfaces: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            frames: AtomicU64::new(0),
        })
    }

    pub fn display(&self) -> DisplayInfo {
        self.display
    }

    pub fn driver(&self) -> &Arc<dyn GlesDriver> {
        &self.driver
    }

    fn in_use(&self, handle: u32) -> bool {
        lock(&self.buffers).contains_key(&handle)
            || lock(&self.contexts).contains_key(&handle)
            || lock(&self.surfaces).contains_key(&handle)
    }

    /// Next free non-zero handle; the counter may have wrapped
    fn handle(&self) -> Result<u32> {
        for _ in 0..HANDLE_ATTEMPTS {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 && !self.in_use(handle) {
                return Ok(handle);
            }
        }
        Err(RendererError::HandlesExhausted)
    }

    // ========================================================================
    // Color buffers
    // ========================================================================

    /// Create a color buffer with a reference count of one
    pub fn create_color_buffer(&self, width: u32, height: u32, format: u32) -> Result<u32> {
        let handle = self.handle()?;
        let buffer = ColorBuffer::create(
            Arc::clone(&self.driver),
            self.helper.clone(),
            width,
            height,
            format,
            true,
        )?;
        lock(&self.buffers).insert(
            handle,
            Entry {
                buffer: Arc::new(buffer),
                refs: 1,
            },
        );
        debug!("color buffer {handle}: {width}x{height} format {format:#x}");
        Ok(handle)
    }

    pub fn open_color_buffer(&self, handle: u32) -> Result<()> {
        let mut buffers = lock(&self.buffers);
        let entry = buffers
            .get_mut(&handle)
            .ok_or(RendererError::UnknownHandle(handle))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one reference; the buffer is destroyed with the last one
    pub fn close_color_buffer(&self, handle: u32) -> Result<()> {
        let released = {
            let mut buffers = lock(&self.buffers);
            let entry = buffers
                .get_mut(&handle)
                .ok_or(RendererError::UnknownHandle(handle))?;
            entry.refs -= 1;
            if entry.refs == 0 {
                buffers.remove(&handle)
            } else {
                None
            }
        };
        if released.is_some() {
            debug!("color buffer {handle} destroyed");
        }
        // the buffer tears down here, outside the registry lock
        drop(released);
        Ok(())
    }

    pub fn color_buffer(&self, handle: u32) -> Option<Arc<ColorBuffer>> {
        lock(&self.buffers)
            .get(&handle)
            .map(|entry| Arc::clone(&entry.buffer))
    }

    fn require(&self, handle: u32) -> Result<Arc<ColorBuffer>> {
        self.color_buffer(handle)
            .ok_or(RendererError::UnknownHandle(handle))
    }

    pub fn update_color_buffer(
        &self,
        handle: u32,
        rect: Rect,
        format: u32,
        ty: u32,
        pixels: &[u8],
    ) -> Result<bool> {
        Ok(self.require(handle)?.sub_update(rect, format, ty, pixels))
    }

    pub fn read_color_buffer(
        &self,
        handle: u32,
        rect: Rect,
        format: u32,
        ty: u32,
        out: &mut [u8],
    ) -> Result<bool> {
        Ok(self.require(handle)?.read_pixels(rect, format, ty, out))
    }

    pub fn bind_color_buffer_to_texture(&self, handle: u32) -> Result<bool> {
        Ok(self.require(handle)?.bind_to_texture())
    }

    pub fn bind_color_buffer_to_renderbuffer(&self, handle: u32) -> Result<bool> {
        Ok(self.require(handle)?.bind_to_renderbuffer())
    }

    pub fn blit_from_current_read_buffer(&self, handle: u32) -> Result<bool> {
        Ok(self.require(handle)?.blit_from_current_read_buffer())
    }

    // ========================================================================
    // Guest contexts and surfaces
    // ========================================================================

    /// Create a guest context sharing objects with `share` (0: the host)
    pub fn create_context(&self, share: u32) -> Result<u32> {
        let share = if share == 0 {
            self.helper.host.context()
        } else {
            *lock(&self.contexts)
                .get(&share)
                .ok_or(RendererError::UnknownHandle(share))?
        };
        let handle = self.handle()?;
        let context = self.driver.create_context(share);
        if context.is_null() {
            return Err(RendererError::Driver("context"));
        }
        lock(&self.contexts).insert(handle, context);
        Ok(handle)
    }

    pub fn destroy_context(&self, handle: u32) -> Result<()> {
        let context = lock(&self.contexts)
            .remove(&handle)
            .ok_or(RendererError::UnknownHandle(handle))?;
        self.driver.destroy_context(context);
        Ok(())
    }

    /// Create an off-screen guest surface
    pub fn create_window_surface(&self, width: u32, height: u32) -> Result<u32> {
        if !valid_image_size(width, height) {
            return Err(RendererError::InvalidSize(width, height));
        }
        let handle = self.handle()?;
        let surface = self.driver.create_pbuffer_surface(width, height);
        if surface.is_null() {
            return Err(RendererError::Driver("surface"));
        }
        lock(&self.surfaces).insert(handle, surface);
        Ok(handle)
    }

    pub fn destroy_window_surface(&self, handle: u32) -> Result<()> {
        let surface = lock(&self.surfaces)
            .remove(&handle)
            .ok_or(RendererError::UnknownHandle(handle))?;
        self.driver.destroy_surface(surface);
        Ok(())
    }

    /// Bind a guest context and surfaces to the calling thread
    ///
    /// A zero context unbinds.
    pub fn make_current(&self, context: u32, draw: u32, read: u32) -> Result<bool> {
        if context == 0 {
            return Ok(self.driver.release_current());
        }
        let context = *lock(&self.contexts)
            .get(&context)
            .ok_or(RendererError::UnknownHandle(context))?;
        let (draw, read) = {
            let surfaces = lock(&self.surfaces);
            let draw = *surfaces
                .get(&draw)
                .ok_or(RendererError::UnknownHandle(draw))?;
            let read = *surfaces
                .get(&read)
                .ok_or(RendererError::UnknownHandle(read))?;
            (draw, read)
        };
        Ok(self.driver.make_current(Binding {
            draw,
            read,
            context,
        }))
    }

    pub fn fb_param(&self, param: FbParam) -> u32 {
        match param {
            FbParam::Width => self.display.width,
            FbParam::Height => self.display.height,
            FbParam::XDpi => self.display.xdpi,
            FbParam::YDpi => self.display.ydpi,
            FbParam::Fps => self.display.refresh_rate,
            FbParam::Format => GL_RGBA,
            FbParam::MinSwapInterval | FbParam::MaxSwapInterval => 1,
        }
    }

    // ========================================================================
    // Composition
    // ========================================================================

    fn window_surface(&self, window: &Arc<dyn NativeWindow>) -> SurfaceId {
        let mut windows = lock(&self.windows);
        if let Some(surface) = windows.get(&window.raw_handle()) {
            return *surface;
        }
        let surface = self.driver.create_window_surface(Arc::clone(window));
        if !surface.is_null() {
            windows.insert(window.raw_handle(), surface);
        }
        surface
    }

    /// Compose `renderables` in order into `target` of `window` and present
    pub fn draw(
        &self,
        window: &Arc<dyn NativeWindow>,
        target: Rect,
        renderables: &[Renderable],
    ) -> bool {
        let surface = self.window_surface(window);
        if surface.is_null() {
            warn!("no surface for window {:#x}", window.raw_handle());
            return false;
        }
        let binder = self.helper.host.bind_surface(surface);
        let scope = ScopedContext::new(&binder);
        if !scope.is_ok() {
            return false;
        }

        let d = &self.driver;
        let (_, window_height) = window.size();
        d.bind_framebuffer(FramebufferId::NULL);
        d.viewport(target.viewport(window_height));
        d.clear_color(0.0, 0.0, 0.0, 1.0);
        d.clear();

        for renderable in renderables {
            let Some(buffer) = self.color_buffer(renderable.buffer) else {
                warn!(
                    "layer {}: unknown color buffer {}",
                    renderable.name, renderable.buffer
                );
                continue;
            };
            let texture = buffer.bind();
            if texture.is_null() {
                continue;
            }
            let destination = renderable.destination.unwrap_or(target);
            d.viewport(destination.viewport(window_height));
            self.helper.draw.draw(texture);
        }

        d.swap_buffers(surface);
        self.frames.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn stats(&self) -> RendererStats {
        RendererStats {
            color_buffers: lock(&self.buffers).len(),
            contexts: lock(&self.contexts).len(),
            surfaces: lock(&self.surfaces).len(),
            frames: self.frames.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let buffers: Vec<Entry> = lock(&self.buffers).drain().map(|(_, e)| e).collect();
        drop(buffers);
        for (_, context) in lock(&self.contexts).drain() {
            self.driver.destroy_context(context);
        }
        for (_, surface) in lock(&self.surfaces).drain() {
            self.driver.destroy_surface(surface);
        }
        for (_, surface) in lock(&self.windows).drain() {
            self.driver.destroy_surface(surface);
        }
    }
}
