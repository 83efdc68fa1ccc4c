// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Color buffers
//!
//! A color buffer is the guest-visible unit of renderable storage: a host
//! texture holding the pixels, a second texture used as a copy target for
//! blits, optional shareable images aliasing both, and a framebuffer object
//! created on first read-back or blit.
//!
//! Every operation binds the host context through the buffer's
//! [`ColorBufferHelper`] for its whole duration. Per-buffer mutable state is
//! only touched while that context is held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, warn};
use thiserror::Error;

use crate::context::{ContextBinder, ScopedContext};
use crate::gles::format::{
    GL_RGB, GL_RGB565_OES, GL_RGB5_A1_OES, GL_RGBA, GL_RGBA4_OES, GL_UNSIGNED_BYTE,
};
use crate::gles::{
    image_bytes, valid_image_size, Filter, FramebufferId, FramebufferStatus, GlesDriver, ImageId,
    PixelFormat, Rect, TexParam, TextureId, Viewport, Wrap,
};
use crate::texture_draw::TextureDraw;
use crate::texture_resize::TextureResize;

/// Requested format to canonical storage format
const FORMAT_TABLE: [(u32, PixelFormat); 5] = [
    (GL_RGB, PixelFormat::Rgb),
    (GL_RGB565_OES, PixelFormat::Rgb),
    (GL_RGBA, PixelFormat::Rgba),
    (GL_RGB5_A1_OES, PixelFormat::Rgba),
    (GL_RGBA4_OES, PixelFormat::Rgba),
];

/// Canonical storage format for a requested format, if supported
pub fn canonical_format(requested: u32) -> Option<PixelFormat> {
    FORMAT_TABLE
        .iter()
        .find(|(format, _)| *format == requested)
        .map(|(_, canonical)| *canonical)
}

/// Errors from color buffer creation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorBufferError {
    /// Format outside the RGB/RGBA families
    #[error("unsupported color buffer format {0:#x}")]
    UnsupportedFormat(u32),

    /// Zero width or height, or an edge above `MAX_TEXTURE_SIZE`
    #[error("invalid color buffer size {0}x{1}")]
    InvalidSize(u32, u32),

    /// Host context could not be bound
    #[error("host context unavailable")]
    ContextUnavailable,
}

/// Context and compositing provider for color buffers
pub trait ColorBufferHelper: ContextBinder {
    fn texture_draw(&self) -> &TextureDraw;

    /// Resolution buffers are resampled to for compositing
    fn display_size(&self) -> (u32, u32);
}

#[derive(Debug)]
struct BufferState {
    framebuffer: FramebufferId,
    resize: TextureResize,
}

pub struct ColorBuffer {
    driver: Arc<dyn GlesDriver>,
    helper: Arc<dyn ColorBufferHelper>,
    width: u32,
    height: u32,
    format: PixelFormat,
    texture: TextureId,
    blit_texture: TextureId,
    image: ImageId,
    blit_image: ImageId,
    state: Mutex<BufferState>,
}

impl ColorBuffer {
    /// Allocate a `width`x`height` buffer
    ///
    /// Unsupported formats are rejected before any host resource is
    /// allocated. Shareable images are best effort: a buffer is returned
    /// even when they could not be created.
    pub fn create(
        driver: Arc<dyn GlesDriver>,
        helper: Arc<dyn ColorBufferHelper>,
        width: u32,
        height: u32,
        format: u32,
        shareable: bool,
    ) -> Result<Self, ColorBufferError> {
        let format = canonical_format(format).ok_or(ColorBufferError::UnsupportedFormat(format))?;
        if !valid_image_size(width, height) {
            return Err(ColorBufferError::InvalidSize(width, height));
        }
        let len = image_bytes(width, height, format.components())
            .ok_or(ColorBufferError::InvalidSize(width, height))?;

        let scope = ScopedContext::new(&*helper);
        if !scope.is_ok() {
            return Err(ColorBufferError::ContextUnavailable);
        }

        let zeros = vec![0u8; len];
        let texture = driver.gen_texture();
        driver.bind_texture(texture);
        driver.tex_image_2d(
            format,
            width,
            height,
            format.gl_enum(),
            GL_UNSIGNED_BYTE,
            Some(zeros.as_slice()),
        );
        driver.tex_parameter(TexParam::MinFilter(Filter::Linear));
        driver.tex_parameter(TexParam::MagFilter(Filter::Linear));
        driver.tex_parameter(TexParam::WrapS(Wrap::ClampToEdge));
        driver.tex_parameter(TexParam::WrapT(Wrap::ClampToEdge));

        let blit_texture = driver.gen_texture();
        driver.bind_texture(blit_texture);
        driver.tex_image_2d(format, width, height, format.gl_enum(), GL_UNSIGNED_BYTE, None);
        driver.tex_parameter(TexParam::MinFilter(Filter::Nearest));
        driver.tex_parameter(TexParam::MagFilter(Filter::Nearest));
        driver.tex_parameter(TexParam::WrapS(Wrap::ClampToEdge));
        driver.tex_parameter(TexParam::WrapT(Wrap::ClampToEdge));

        let mut image = ImageId::NULL;
        let mut blit_image = ImageId::NULL;
        if shareable {
            let context = driver.current_binding().context;
            image = driver.create_image(context, texture);
            if image.is_null() {
                warn!("color buffer {width}x{height}: shareable image unavailable");
            } else {
                blit_image = driver.create_image(context, blit_texture);
            }
        }

        let resize = TextureResize::new((width, height), helper.display_size());
        drop(scope);
        Ok(Self {
            driver,
            helper,
            width,
            height,
            format,
            texture,
            blit_texture,
            image,
            blit_image,
            state: Mutex::new(BufferState {
                framebuffer: FramebufferId::NULL,
                resize,
            }),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Canonical internal format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Primary texture
    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn has_shareable_image(&self) -> bool {
        !self.image.is_null()
    }

    /// Must only be called with the host context held
    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the framebuffer, creating it on first use
    fn bind_framebuffer(&self, state: &mut BufferState) -> bool {
        if !state.framebuffer.is_null() {
            self.driver.bind_framebuffer(state.framebuffer);
            return true;
        }
        let framebuffer = self.driver.gen_framebuffer();
        self.driver.bind_framebuffer(framebuffer);
        self.driver.framebuffer_texture_2d(self.texture);
        let status = self.driver.check_framebuffer_status();
        if status != FramebufferStatus::Complete {
            error!("color buffer framebuffer incomplete: {:#x}", status.code());
            self.driver.bind_framebuffer(FramebufferId::NULL);
            self.driver.delete_framebuffers(&[framebuffer]);
            return false;
        }
        state.framebuffer = framebuffer;
        true
    }

    /// Read `rect` into `out`; `out` is untouched on failure
    pub fn read_pixels(&self, rect: Rect, format: u32, ty: u32, out: &mut [u8]) -> bool {
        let scope = ScopedContext::new(&*self.helper);
        if !scope.is_ok() {
            return false;
        }
        let mut state = self.state();
        if !self.bind_framebuffer(&mut state) {
            return false;
        }
        self.driver
            .read_pixels(rect.x, rect.y, rect.width, rect.height, format, ty, out);
        self.driver.bind_framebuffer(FramebufferId::NULL);
        true
    }

    /// Upload `pixels` into `rect` of the primary texture, rows tightly packed
    pub fn sub_update(&self, rect: Rect, format: u32, ty: u32, pixels: &[u8]) -> bool {
        let scope = ScopedContext::new(&*self.helper);
        if !scope.is_ok() {
            return false;
        }
        self.driver.bind_texture(self.texture);
        self.driver.pixel_store_unpack_alignment(1);
        self.driver
            .tex_sub_image_2d(rect.x, rect.y, rect.width, rect.height, format, ty, pixels);
        true
    }

    /// Whole buffer as RGBA8; `out` must hold `width * height * 4` bytes
    pub fn readback(&self, out: &mut [u8]) -> bool {
        if out.len() < self.width as usize * self.height as usize * 4 {
            return false;
        }
        self.read_pixels(
            Rect::full(self.width, self.height),
            GL_RGBA,
            GL_UNSIGNED_BYTE,
            out,
        )
    }

    /// Copy the current read surface of the calling thread into this buffer
    ///
    /// The copy lands in the blit texture through its shareable image and is
    /// then drawn onto the primary texture. Requires a guest context to be
    /// current.
    pub fn blit_from_current_read_buffer(&self) -> bool {
        let d = &self.driver;
        if d.current_binding().context.is_null() {
            warn!("blit into color buffer without a current context");
            return false;
        }
        if self.blit_image.is_null() {
            warn!("blit into color buffer without a shareable image");
            return false;
        }

        // guest context: copy the read surface into the blit image
        let previous = d.texture_binding();
        let copy = d.gen_texture();
        d.bind_texture(copy);
        d.image_target_texture_2d(self.blit_image);
        d.copy_tex_sub_image_2d(0, 0, 0, 0, self.width, self.height);
        d.delete_textures(&[copy]);
        d.bind_texture(previous);

        let scope = ScopedContext::new(&*self.helper);
        if !scope.is_ok() {
            return false;
        }
        let mut state = self.state();
        if !self.bind_framebuffer(&mut state) {
            return false;
        }
        let saved = d.get_viewport();
        d.viewport(Viewport::new(0, 0, self.width as i32, self.height as i32));
        let drawn = self.helper.texture_draw().draw(self.blit_texture);
        d.viewport(saved);
        d.bind_framebuffer(FramebufferId::NULL);
        drawn
    }

    /// Make the bound texture of the current context alias this buffer
    pub fn bind_to_texture(&self) -> bool {
        if self.image.is_null() || self.driver.current_binding().context.is_null() {
            return false;
        }
        self.driver.image_target_texture_2d(self.image);
        true
    }

    /// Make the bound renderbuffer of the current context alias this buffer
    pub fn bind_to_renderbuffer(&self) -> bool {
        if self.image.is_null() || self.driver.current_binding().context.is_null() {
            return false;
        }
        self.driver.image_target_renderbuffer_storage(self.image);
        true
    }

    /// Texture to composite, resampled to the display size if needed
    ///
    /// Returns the null texture if the host context is unavailable.
    pub fn bind(&self) -> TextureId {
        let scope = ScopedContext::new(&*self.helper);
        if !scope.is_ok() {
            return TextureId::NULL;
        }
        let mut state = self.state();
        let texture = state
            .resize
            .update(&*self.driver, self.helper.texture_draw(), self.texture);
        self.driver.bind_texture(texture);
        texture
    }
}

impl Drop for ColorBuffer {
    fn drop(&mut self) {
        let scope = ScopedContext::new(&*self.helper);
        if !scope.is_ok() {
            error!(
                "leaking {}x{} color buffer: host context unavailable",
                self.width, self.height
            );
            return;
        }
        let d = &self.driver;
        if !self.blit_image.is_null() {
            d.destroy_image(self.blit_image);
        }
        if !self.image.is_null() {
            d.destroy_image(self.image);
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.framebuffer.is_null() {
            d.delete_framebuffers(&[state.framebuffer]);
        }
        d.delete_textures(&[self.texture, self.blit_texture]);
        state.resize.release(&**d);
    }
}
