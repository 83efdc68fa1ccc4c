// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! ananbox host renderer core
//!
//! GPU object virtualization for Android guests: guests create and mutate
//! virtual color buffers through an opaque handle protocol, and the host
//! executes that work against its own graphics driver and composites the
//! results into a visible window.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Guest command streams (host crate)           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ handles
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Renderer                              │
//! │  - Color buffer registry (refcounted handles)               │
//! │  - Guest contexts / surfaces                                │
//! │  - draw(window, rect, renderables)  ◄── LayerComposer       │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   ColorBuffer ── TextureResize ── TextureDraw                │
//! │        every GPU operation inside a ScopedContext           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                HostContext  (per-thread, re-entrant)         │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             GlesDriver  (SoftwareDriver or host EGL)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ananbox_render::{DisplayInfo, Renderer, SoftwareDriver};
//!
//! let renderer = Renderer::new(Arc::new(SoftwareDriver::new()), DisplayInfo::default())?;
//! let handle = renderer.create_color_buffer(64, 64, GL_RGBA)?;
//! ```
//!
//! # Modules
//!
//! - [`gles`]: host driver capability surface
//! - [`software`]: in-memory reference driver
//! - [`context`]: render thread context guard
//! - [`color_buffer`]: virtual off-screen surfaces
//! - [`texture_draw`]: full-viewport texture compositor
//! - [`texture_resize`]: display resampling
//! - [`renderer`]: handle registry and compose entry point
//! - [`layer_composer`]: layer list submission

pub mod color_buffer;
pub mod context;
pub mod gles;
pub mod layer_composer;
pub mod renderer;
pub mod software;
pub mod texture_draw;
pub mod texture_resize;

pub use color_buffer::{canonical_format, ColorBuffer, ColorBufferError, ColorBufferHelper};
pub use context::{with_context, ContextBinder, HostContext, ScopedContext};
pub use gles::{Frame, GlesDriver, NativeWindow, PixelFormat, Rect};
pub use layer_composer::{LayerComposer, Renderable};
pub use renderer::{DisplayInfo, FbParam, RenderHelper, Renderer, RendererError, RendererStats};
pub use software::SoftwareDriver;
pub use texture_draw::TextureDraw;
