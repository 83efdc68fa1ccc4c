// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for color buffers
//!
//! This file contains end-to-end tests for:
//! - Creation over the supported and unsupported formats
//! - Upload / read-back round trips
//! - Blits from a guest surface
//! - Teardown after partial construction
//! - Concurrent use from several worker threads

use std::sync::Arc;
use std::thread;

use ananbox_render::gles::format::{
    GL_RGB, GL_RGB565_OES, GL_RGB5_A1_OES, GL_RGBA, GL_RGBA4_OES, GL_UNSIGNED_BYTE,
};
use ananbox_render::gles::{Binding, ContextId, Viewport};
use ananbox_render::{
    ColorBuffer, ColorBufferError, GlesDriver, PixelFormat, Rect, RenderHelper, SoftwareDriver,
    TextureDraw,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn setup(display: (u32, u32)) -> (Arc<SoftwareDriver>, Arc<RenderHelper>) {
    let driver = Arc::new(SoftwareDriver::new());
    let helper = RenderHelper::new(driver.clone(), display).unwrap();
    (driver, Arc::new(helper))
}

fn create(driver: &Arc<SoftwareDriver>, helper: &Arc<RenderHelper>, w: u32, h: u32) -> ColorBuffer {
    ColorBuffer::create(driver.clone(), helper.clone(), w, h, GL_RGBA, true).unwrap()
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_supported_formats_normalize() {
    let (driver, helper) = setup((16, 16));
    let cases = [
        (GL_RGB, PixelFormat::Rgb),
        (GL_RGB565_OES, PixelFormat::Rgb),
        (GL_RGBA, PixelFormat::Rgba),
        (GL_RGB5_A1_OES, PixelFormat::Rgba),
        (GL_RGBA4_OES, PixelFormat::Rgba),
    ];
    for (requested, canonical) in cases {
        let cb = ColorBuffer::create(driver.clone(), helper.clone(), 16, 16, requested, false).unwrap();
        assert_eq!(cb.format(), canonical, "format {requested:#x}");
        assert_eq!((cb.width(), cb.height()), (16, 16));
    }
}

#[test]
fn test_unsupported_formats_allocate_nothing() {
    let (driver, helper) = setup((16, 16));
    let baseline = driver.objects();
    for requested in [0u32, 0x1906, 0x1909, 0x190A, 0x8D64, 0x80E1] {
        let result = ColorBuffer::create(driver.clone(), helper.clone(), 16, 16, requested, true);
        assert_eq!(result.err(), Some(ColorBufferError::UnsupportedFormat(requested)));
    }
    assert_eq!(driver.objects(), baseline);
}

#[test]
fn test_readback_after_create_is_zero() {
    let (driver, helper) = setup((16, 16));
    for (w, h) in [(1, 1), (16, 16), (33, 7)] {
        let cb = create(&driver, &helper, w, h);
        let mut out = vec![0xEEu8; (w * h * 4) as usize];
        assert!(cb.readback(&mut out));
        assert!(out.iter().all(|b| *b == 0), "{w}x{h}");
    }
}

#[test]
fn test_readback_of_rgb_buffer_is_opaque_rgba() {
    let (driver, helper) = setup((4, 4));
    let cb = ColorBuffer::create(driver.clone(), helper.clone(), 2, 1, GL_RGB, false).unwrap();
    assert!(cb.sub_update(Rect::full(2, 1), GL_RGB, GL_UNSIGNED_BYTE, &[1, 2, 3, 4, 5, 6]));
    let mut out = [0u8; 8];
    assert!(cb.readback(&mut out));
    assert_eq!(out, [1, 2, 3, 0xff, 4, 5, 6, 0xff]);
}

#[test]
fn test_short_readback_buffer_is_refused() {
    let (driver, helper) = setup((16, 16));
    let cb = create(&driver, &helper, 4, 4);
    let mut out = vec![0x33u8; 63];
    assert!(!cb.readback(&mut out));
    assert!(out.iter().all(|b| *b == 0x33));
}

// ============================================================================
// Upload / read-back
// ============================================================================

#[test]
fn test_sub_update_round_trip() {
    let (driver, helper) = setup((16, 16));
    let cb = create(&driver, &helper, 16, 16);

    let rect = Rect::new(3, 5, 7, 2);
    let pixels: Vec<u8> = (0..7 * 2 * 4).map(|i| i as u8).collect();
    assert!(cb.sub_update(rect, GL_RGBA, GL_UNSIGNED_BYTE, &pixels));
    let mut out = vec![0u8; pixels.len()];
    assert!(cb.read_pixels(rect, GL_RGBA, GL_UNSIGNED_BYTE, &mut out));
    assert_eq!(out, pixels);

    let full: Vec<u8> = (0..16 * 16 * 4).map(|i| (i * 7) as u8).collect();
    assert!(cb.sub_update(Rect::full(16, 16), GL_RGBA, GL_UNSIGNED_BYTE, &full));
    let mut out = vec![0u8; full.len()];
    assert!(cb.read_pixels(Rect::full(16, 16), GL_RGBA, GL_UNSIGNED_BYTE, &mut out));
    assert_eq!(out, full);
}

#[test]
fn test_red_quadrant_scenario() {
    let (driver, helper) = setup((64, 64));
    let cb = create(&driver, &helper, 64, 64);

    let red: Vec<u8> = [0xff, 0, 0, 0xff].repeat(32 * 32);
    assert!(cb.sub_update(Rect::new(0, 0, 32, 32), GL_RGBA, GL_UNSIGNED_BYTE, &red));

    let mut out = vec![0u8; 64 * 64 * 4];
    assert!(cb.readback(&mut out));
    for y in 0..64 {
        for x in 0..64 {
            let pixel = &out[(y * 64 + x) * 4..(y * 64 + x) * 4 + 4];
            if x < 32 && y < 32 {
                assert_eq!(pixel, [0xff, 0, 0, 0xff], "({x}, {y})");
            } else {
                assert_eq!(pixel, [0, 0, 0, 0], "({x}, {y})");
            }
        }
    }
}

// ============================================================================
// Blit
// ============================================================================

#[test]
fn test_blit_without_context_fails_and_keeps_viewport() {
    let (driver, helper) = setup((8, 8));
    let cb = create(&driver, &helper, 8, 8);
    let viewport = driver.get_viewport();
    let calls = driver.call_count();
    assert!(!cb.blit_from_current_read_buffer());
    assert_eq!(driver.get_viewport(), viewport);
    // the current-context check plus the viewport query
    assert_eq!(driver.call_count(), calls + 2);
}

#[test]
fn test_blit_copies_guest_read_surface() {
    let (driver, helper) = setup((8, 8));
    let cb = create(&driver, &helper, 8, 8);

    let guest = driver.create_context(helper.host().context());
    let surface = driver.create_pbuffer_surface(8, 8);
    let binding = Binding {
        draw: surface,
        read: surface,
        context: guest,
    };
    assert!(driver.make_current(binding));
    driver.clear_color(0.0, 1.0, 0.0, 1.0);
    driver.clear();
    driver.viewport(Viewport::new(1, 1, 3, 3));

    assert!(cb.blit_from_current_read_buffer());
    assert_eq!(driver.current_binding(), binding);
    assert_eq!(driver.get_viewport(), Viewport::new(1, 1, 3, 3));

    let mut out = vec![0u8; 8 * 8 * 4];
    assert!(cb.readback(&mut out));
    assert!(out.chunks(4).all(|p| p == [0, 0xff, 0, 0xff]));
    driver.release_current();
}

#[test]
fn test_blit_needs_shareable_image() {
    let (driver, helper) = setup((8, 8));
    let cb = ColorBuffer::create(driver.clone(), helper.clone(), 8, 8, GL_RGBA, false).unwrap();
    let guest = driver.create_context(ContextId::NULL);
    let surface = driver.create_pbuffer_surface(8, 8);
    assert!(driver.make_current(Binding {
        draw: surface,
        read: surface,
        context: guest,
    }));
    assert!(!cb.blit_from_current_read_buffer());
    assert!(!cb.bind_to_texture());
    driver.release_current();
}

#[test]
fn test_bind_to_texture_aliases_storage() {
    let (driver, helper) = setup((8, 8));
    let cb = create(&driver, &helper, 2, 2);
    assert!(cb.sub_update(Rect::full(2, 2), GL_RGBA, GL_UNSIGNED_BYTE, &[9; 16]));

    let guest = driver.create_context(helper.host().context());
    let surface = driver.create_pbuffer_surface(2, 2);
    assert!(driver.make_current(Binding {
        draw: surface,
        read: surface,
        context: guest,
    }));
    let texture = driver.gen_texture();
    driver.bind_texture(texture);
    assert!(cb.bind_to_texture());
    assert_eq!(driver.texture_pixels(texture).unwrap(), vec![9; 16]);
    assert!(cb.bind_to_renderbuffer());
    driver.delete_textures(&[texture]);
    driver.release_current();
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_partial_construction_does_not_leak() {
    let (driver, helper) = setup((8, 8));
    let baseline = driver.objects();
    driver.set_image_failure(true);
    let cb = create(&driver, &helper, 8, 8);
    assert!(!cb.has_shareable_image());
    driver.set_image_failure(false);
    drop(cb);
    assert_eq!(driver.objects(), baseline);
}

#[test]
fn test_teardown_after_use_does_not_leak() {
    let (driver, helper) = setup((16, 16));
    let baseline = driver.objects();
    let cb = create(&driver, &helper, 8, 8);
    let mut out = vec![0u8; 8 * 8 * 4];
    assert!(cb.readback(&mut out));
    assert!(!cb.bind().is_null());
    drop(cb);
    assert_eq!(driver.objects(), baseline);
}

// ============================================================================
// Texture compositor
// ============================================================================

#[test]
fn test_unlinkable_program_disables_compositor() {
    let (driver, helper) = setup((8, 8));
    let draw = TextureDraw::with_sources(
        driver.clone(),
        helper.host().clone(),
        "attribute vec4 position;\nvoid main(void) {}\n",
        "#error intentionally broken\nvoid main(void) {}\n",
    );
    assert!(!draw.is_enabled());
    let calls = driver.call_count();
    let cb = create(&driver, &helper, 2, 2);
    let after_create = driver.call_count();
    assert!(after_create > calls);
    assert!(!draw.draw(cb.texture()));
    assert_eq!(driver.call_count(), after_create);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_buffers_stay_consistent() {
    const SIZE: u32 = 24;
    let (driver, helper) = setup((SIZE, SIZE));
    let buffers: Vec<Arc<ColorBuffer>> = (0..2)
        .map(|_| Arc::new(create(&driver, &helper, SIZE, SIZE)))
        .collect();

    let workers: Vec<_> = buffers
        .iter()
        .enumerate()
        .map(|(seed, cb)| {
            let cb = Arc::clone(cb);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64 + 1);
                let mut shadow = vec![0u8; (SIZE * SIZE * 4) as usize];
                for _ in 0..200 {
                    let x = rng.gen_range(0..SIZE);
                    let y = rng.gen_range(0..SIZE);
                    let w = rng.gen_range(1..=SIZE - x);
                    let h = rng.gen_range(1..=SIZE - y);
                    let rect = Rect::new(x as i32, y as i32, w, h);
                    let pixels: Vec<u8> = (0..w * h * 4).map(|_| rng.gen()).collect();
                    assert!(cb.sub_update(rect, GL_RGBA, GL_UNSIGNED_BYTE, &pixels));
                    for row in 0..h {
                        let src = (row * w * 4) as usize;
                        let dst = (((y + row) * SIZE + x) * 4) as usize;
                        shadow[dst..dst + (w * 4) as usize]
                            .copy_from_slice(&pixels[src..src + (w * 4) as usize]);
                    }

                    let mut out = vec![0u8; pixels.len()];
                    assert!(cb.read_pixels(rect, GL_RGBA, GL_UNSIGNED_BYTE, &mut out));
                    assert_eq!(out, pixels);
                    if rng.gen_bool(0.1) {
                        let mut full = vec![0u8; shadow.len()];
                        assert!(cb.readback(&mut full));
                        assert_eq!(full, shadow);
                    }
                }
                let mut full = vec![0u8; shadow.len()];
                assert!(cb.readback(&mut full));
                assert_eq!(full, shadow);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}
