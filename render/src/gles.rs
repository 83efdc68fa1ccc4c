// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Host graphics driver capability surface
//!
//! The renderer never talks to EGL/GLES directly. Everything it needs from the
//! host driver goes through [`GlesDriver`], which mirrors the small subset of
//! EGL and OpenGL ES 2.0 entry points used by color buffers and compositing.
//! Handles are plain integers wrapped in newtypes; the zero value of every
//! handle is the null sentinel and operations on it are no-ops.

use std::fmt;
use std::sync::Arc;

macro_rules! gl_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Null sentinel
            pub const NULL: Self = Self(0);

            /// Whether this is the null sentinel
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

gl_handle!(
    /// Texture object name
    TextureId
);
gl_handle!(
    /// Framebuffer object name
    FramebufferId
);
gl_handle!(
    /// Vertex or index buffer object name
    BufferId
);
gl_handle!(
    /// Shader object name
    ShaderId
);
gl_handle!(
    /// Program object name
    ProgramId
);
gl_handle!(
    /// Shareable image (EGLImage) handle
    ImageId
);
gl_handle!(
    /// Rendering context handle
    ContextId
);
gl_handle!(
    /// Drawable surface handle (pbuffer or window)
    SurfaceId
);

/// Largest texture or surface edge the host accepts
pub const MAX_TEXTURE_SIZE: u32 = 4096;

/// Bytes in a `width`x`height` image of `components` bytes per pixel
///
/// `None` when the product overflows.
pub fn image_bytes(width: u32, height: u32, components: usize) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(components)
}

/// Whether a texture or surface of this size can be allocated
pub fn valid_image_size(width: u32, height: u32) -> bool {
    (1..=MAX_TEXTURE_SIZE).contains(&width) && (1..=MAX_TEXTURE_SIZE).contains(&height)
}

/// GL enum values accepted as pixel formats
pub mod format {
    pub const GL_RGB: u32 = 0x1907;
    pub const GL_RGBA: u32 = 0x1908;
    pub const GL_RGB565_OES: u32 = 0x8D62;
    pub const GL_RGB5_A1_OES: u32 = 0x8057;
    pub const GL_RGBA4_OES: u32 = 0x8056;
    pub const GL_UNSIGNED_BYTE: u32 = 0x1401;
}

/// Canonical texture storage format
///
/// Every requested color buffer format collapses to one of these two.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Three 8-bit components
    Rgb = format::GL_RGB,
    /// Four 8-bit components
    Rgba = format::GL_RGBA,
}

impl PixelFormat {
    /// Bytes per pixel for `GL_UNSIGNED_BYTE` data
    pub fn components(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }

    /// GL enum value
    pub fn gl_enum(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = u32;

    /// Only the exact transfer formats; sized internal formats are handled by
    /// the color buffer format table.
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            format::GL_RGB => Ok(PixelFormat::Rgb),
            format::GL_RGBA => Ok(PixelFormat::Rgba),
            other => Err(other),
        }
    }
}

/// Pixel component type
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    UnsignedByte = format::GL_UNSIGNED_BYTE,
}

impl TryFrom<u32> for PixelType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            format::GL_UNSIGNED_BYTE => Ok(PixelType::UnsignedByte),
            other => Err(other),
        }
    }
}

/// Texture sampling filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Texture coordinate wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    ClampToEdge,
    Repeat,
}

/// Texture parameter for `glTexParameteri`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexParam {
    MinFilter(Filter),
    MagFilter(Filter),
    WrapS(Wrap),
    WrapT(Wrap),
}

/// Buffer binding point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    Array,
    ElementArray,
}

/// Shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

/// Result of `glCheckFramebufferStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    MissingAttachment,
    Unsupported,
}

impl FramebufferStatus {
    /// Driver status code, as logged on failure
    pub fn code(self) -> u32 {
        match self {
            FramebufferStatus::Complete => 0x8CD5,
            FramebufferStatus::IncompleteAttachment => 0x8CD6,
            FramebufferStatus::MissingAttachment => 0x8CD7,
            FramebufferStatus::Unsupported => 0x8CDD,
        }
    }
}

/// GL error codes reported by `glGetError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlError {
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
}

impl GlError {
    pub fn code(self) -> u32 {
        match self {
            GlError::InvalidEnum => 0x0500,
            GlError::InvalidValue => 0x0501,
            GlError::InvalidOperation => 0x0502,
            GlError::OutOfMemory => 0x0505,
        }
    }
}

/// Viewport rectangle in window coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Viewport {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Pixel rectangle, origin at the top-left corner of its surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width`x`height` surface
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// GL viewport for this rectangle on a surface `surface_height` tall
    pub fn viewport(&self, surface_height: u32) -> Viewport {
        let bottom = surface_height as i32 - (self.y + self.height as i32);
        Viewport::new(self.x, bottom, self.width as i32, self.height as i32)
    }
}

/// Surfaces and context bound to the calling thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Binding {
    pub draw: SurfaceId,
    pub read: SurfaceId,
    pub context: ContextId,
}

impl Binding {
    /// Nothing bound
    pub const NONE: Binding = Binding {
        draw: SurfaceId::NULL,
        read: SurfaceId::NULL,
        context: ContextId::NULL,
    };
}

/// A frame handed to a native window on buffer swap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// RGBA8, top row first
    pub pixels: Vec<u8>,
}

/// Native window collaborator
///
/// Window-system creation is outside the renderer; it only needs a stable
/// identifier for surface caching, the window size, and somewhere for a
/// driver without a real window system to deliver swapped frames.
pub trait NativeWindow: Send + Sync {
    /// Raw window-system handle
    fn raw_handle(&self) -> u64;

    /// Window size in pixels
    fn size(&self) -> (u32, u32);

    /// Receive a presented frame
    fn present(&self, _frame: &Frame) {}
}

/// Host EGL/GLES driver
///
/// Context binding is per calling thread; all other state belongs to the
/// context current on that thread. Calls issued without a current context
/// are ignored, as on a real driver.
pub trait GlesDriver: Send + Sync {
    // EGL

    /// Create a context, optionally sharing objects with `share`
    fn create_context(&self, share: ContextId) -> ContextId;
    fn destroy_context(&self, context: ContextId);
    fn create_pbuffer_surface(&self, width: u32, height: u32) -> SurfaceId;
    fn create_window_surface(&self, window: Arc<dyn NativeWindow>) -> SurfaceId;
    fn destroy_surface(&self, surface: SurfaceId);
    /// Bind `binding` to the calling thread; `Binding::NONE` unbinds
    fn make_current(&self, binding: Binding) -> bool;
    /// Binding of the calling thread
    fn current_binding(&self) -> Binding;
    /// Unbind whatever is current on the calling thread
    fn release_current(&self) -> bool {
        self.make_current(Binding::NONE)
    }
    fn swap_buffers(&self, surface: SurfaceId) -> bool;
    /// Create a shareable image from `texture` of `context`; null on failure
    fn create_image(&self, context: ContextId, texture: TextureId) -> ImageId;
    fn destroy_image(&self, image: ImageId);
    /// Make the bound texture alias the image storage
    fn image_target_texture_2d(&self, image: ImageId);
    /// Make the bound renderbuffer alias the image storage
    fn image_target_renderbuffer_storage(&self, image: ImageId);

    // Textures

    fn gen_texture(&self) -> TextureId;
    fn delete_textures(&self, textures: &[TextureId]);
    fn bind_texture(&self, texture: TextureId);
    /// `GL_TEXTURE_BINDING_2D` of the active unit
    fn texture_binding(&self) -> TextureId;
    fn active_texture(&self, unit: u32);
    fn tex_image_2d(
        &self,
        internal: PixelFormat,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        pixels: Option<&[u8]>,
    );
    #[allow(clippy::too_many_arguments)]
    fn tex_sub_image_2d(
        &self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        pixels: &[u8],
    );
    fn tex_parameter(&self, param: TexParam);
    fn pixel_store_unpack_alignment(&self, alignment: u32);
    /// Copy a region of the current read surface into the bound texture
    fn copy_tex_sub_image_2d(&self, xoffset: i32, yoffset: i32, x: i32, y: i32, width: u32, height: u32);

    // Framebuffers

    fn gen_framebuffer(&self) -> FramebufferId;
    fn delete_framebuffers(&self, framebuffers: &[FramebufferId]);
    fn bind_framebuffer(&self, framebuffer: FramebufferId);
    fn framebuffer_texture_2d(&self, texture: TextureId);
    fn check_framebuffer_status(&self) -> FramebufferStatus;
    #[allow(clippy::too_many_arguments)]
    fn read_pixels(
        &self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        out: &mut [u8],
    );

    // Raster state

    fn viewport(&self, viewport: Viewport);
    fn get_viewport(&self) -> Viewport;
    fn clear_color(&self, r: f32, g: f32, b: f32, a: f32);
    fn clear(&self);

    // Shaders and programs

    fn create_shader(&self, kind: ShaderKind) -> ShaderId;
    fn shader_source(&self, shader: ShaderId, source: &str);
    /// Compile and return `GL_COMPILE_STATUS`
    fn compile_shader(&self, shader: ShaderId) -> bool;
    fn delete_shader(&self, shader: ShaderId);
    fn create_program(&self) -> ProgramId;
    fn attach_shader(&self, program: ProgramId, shader: ShaderId);
    /// Link and return `GL_LINK_STATUS`
    fn link_program(&self, program: ProgramId) -> bool;
    /// Validate and return `GL_VALIDATE_STATUS`
    fn validate_program(&self, program: ProgramId) -> bool;
    fn program_info_log(&self, program: ProgramId) -> String;
    fn use_program(&self, program: ProgramId);
    fn delete_program(&self, program: ProgramId);
    /// Attribute slot, or -1
    fn attrib_location(&self, program: ProgramId, name: &str) -> i32;
    /// Uniform slot, or -1
    fn uniform_location(&self, program: ProgramId, name: &str) -> i32;
    fn uniform_1i(&self, location: i32, value: i32);

    // Geometry

    fn gen_buffer(&self) -> BufferId;
    fn delete_buffers(&self, buffers: &[BufferId]);
    fn bind_buffer(&self, target: BufferTarget, buffer: BufferId);
    fn buffer_data(&self, target: BufferTarget, data: &[u8]);
    fn enable_vertex_attrib_array(&self, slot: i32);
    /// Float attribute of `size` components read from the bound array buffer
    fn vertex_attrib_pointer(&self, slot: i32, size: u32, stride: u32, offset: usize);
    /// Draw `count` triangles' worth of `u8` indices from the bound element buffer
    fn draw_elements(&self, count: u32);

    /// Pop the oldest recorded error
    fn get_error(&self) -> Option<GlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles() {
        assert!(TextureId::NULL.is_null());
        assert!(TextureId::default().is_null());
        assert!(!ImageId(3).is_null());
        assert_eq!(ContextId(7).to_string(), "7");
    }

    #[test]
    fn test_pixel_format_components() {
        assert_eq!(PixelFormat::Rgb.components(), 3);
        assert_eq!(PixelFormat::Rgba.components(), 4);
        assert_eq!(PixelFormat::try_from(format::GL_RGBA), Ok(PixelFormat::Rgba));
        assert_eq!(
            PixelFormat::try_from(format::GL_RGB565_OES),
            Err(format::GL_RGB565_OES)
        );
    }

    #[test]
    fn test_rect_viewport_flips_origin() {
        let rect = Rect::new(10, 20, 100, 50);
        assert_eq!(rect.viewport(768), Viewport::new(10, 698, 100, 50));
        assert_eq!(Rect::full(64, 64).viewport(64), Viewport::new(0, 0, 64, 64));
    }

    #[test]
    fn test_framebuffer_status_codes() {
        assert_eq!(FramebufferStatus::Complete.code(), 0x8CD5);
        assert_eq!(FramebufferStatus::MissingAttachment.code(), 0x8CD7);
    }
}
