// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Resampling of color buffers to the display resolution

use log::error;

use crate::gles::format::{GL_RGBA, GL_UNSIGNED_BYTE};
use crate::gles::{
    Filter, FramebufferId, FramebufferStatus, GlesDriver, PixelFormat, TexParam, TextureId,
    Viewport, Wrap,
};
use crate::texture_draw::TextureDraw;

/// Per color buffer resize state
///
/// All methods expect the host context to be current.
#[derive(Debug)]
pub struct TextureResize {
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
    texture: TextureId,
    framebuffer: FramebufferId,
}

impl TextureResize {
    pub fn new(source: (u32, u32), target: (u32, u32)) -> Self {
        Self {
            source_width: source.0,
            source_height: source.1,
            target_width: target.0,
            target_height: target.1,
            texture: TextureId::NULL,
            framebuffer: FramebufferId::NULL,
        }
    }

    /// Whether `update` resamples at all
    pub fn is_scaling(&self) -> bool {
        (self.source_width, self.source_height) != (self.target_width, self.target_height)
    }

    fn setup(&mut self, driver: &dyn GlesDriver) -> bool {
        if !self.framebuffer.is_null() {
            return true;
        }
        self.texture = driver.gen_texture();
        driver.bind_texture(self.texture);
        driver.tex_image_2d(
            PixelFormat::Rgba,
            self.target_width,
            self.target_height,
            GL_RGBA,
            GL_UNSIGNED_BYTE,
            None,
        );
        driver.tex_parameter(TexParam::MinFilter(Filter::Linear));
        driver.tex_parameter(TexParam::MagFilter(Filter::Linear));
        driver.tex_parameter(TexParam::WrapS(Wrap::ClampToEdge));
        driver.tex_parameter(TexParam::WrapT(Wrap::ClampToEdge));

        self.framebuffer = driver.gen_framebuffer();
        driver.bind_framebuffer(self.framebuffer);
        driver.framebuffer_texture_2d(self.texture);
        let status = driver.check_framebuffer_status();
        driver.bind_framebuffer(FramebufferId::NULL);
        if status != FramebufferStatus::Complete {
            error!("resize framebuffer incomplete: {:#x}", status.code());
            self.release(driver);
            return false;
        }
        true
    }

    /// Texture to composite for `source`
    ///
    /// Returns `source` itself when no scaling is needed or the resize
    /// target cannot be set up.
    pub fn update(&mut self, driver: &dyn GlesDriver, draw: &TextureDraw, source: TextureId) -> TextureId {
        if !self.is_scaling() || !self.setup(driver) {
            return source;
        }
        let saved = driver.get_viewport();
        driver.bind_framebuffer(self.framebuffer);
        driver.viewport(Viewport::new(
            0,
            0,
            self.target_width as i32,
            self.target_height as i32,
        ));
        let drawn = draw.draw(source);
        driver.bind_framebuffer(FramebufferId::NULL);
        driver.viewport(saved);
        if drawn {
            self.texture
        } else {
            source
        }
    }

    /// Free the resize target
    pub fn release(&mut self, driver: &dyn GlesDriver) {
        if !self.framebuffer.is_null() {
            driver.delete_framebuffers(&[self.framebuffer]);
            self.framebuffer = FramebufferId::NULL;
        }
        if !self.texture.is_null() {
            driver.delete_textures(&[self.texture]);
            self.texture = TextureId::NULL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HostContext, ScopedContext};
    use crate::software::SoftwareDriver;
    use std::sync::Arc;

    #[test]
    fn test_same_size_is_passthrough() {
        let driver = Arc::new(SoftwareDriver::new());
        let host = Arc::new(HostContext::new(driver.clone()).unwrap());
        let draw = TextureDraw::new(driver.clone(), host.clone());
        let mut resize = TextureResize::new((8, 8), (8, 8));
        let _scope = ScopedContext::new(&*host);
        assert_eq!(resize.update(&*driver, &draw, TextureId(42)), TextureId(42));
        assert_eq!(driver.objects().framebuffers, 0);
    }

    #[test]
    fn test_scaling_resamples_into_target() {
        let driver = Arc::new(SoftwareDriver::new());
        let host = Arc::new(HostContext::new(driver.clone()).unwrap());
        let draw = TextureDraw::new(driver.clone(), host.clone());
        let scope = ScopedContext::new(&*host);
        assert!(scope.is_ok());

        let source = driver.gen_texture();
        driver.bind_texture(source);
        driver.tex_image_2d(PixelFormat::Rgba, 2, 2, GL_RGBA, GL_UNSIGNED_BYTE, Some(&[7u8; 16][..]));

        let mut resize = TextureResize::new((2, 2), (4, 3));
        let viewport = driver.get_viewport();
        let scaled = resize.update(&*driver, &draw, source);
        assert_ne!(scaled, source);
        assert_eq!(driver.get_viewport(), viewport);
        assert_eq!(driver.texture_pixels(scaled).unwrap(), vec![7; 4 * 3 * 4]);

        resize.release(&*driver);
        driver.delete_textures(&[source]);
        drop(scope);
        assert_eq!(driver.objects().textures, 0);
        assert_eq!(driver.objects().framebuffers, 0);
    }
}
