// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Layer composer

use std::sync::Arc;

use crate::gles::{NativeWindow, Rect};
use crate::renderer::Renderer;

/// A color buffer placed on screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renderable {
    /// Layer name, for diagnostics
    pub name: String,
    /// Color buffer handle
    pub buffer: u32,
    /// Where to draw; the whole target when unset
    pub destination: Option<Rect>,
}

impl Renderable {
    pub fn new(name: impl Into<String>, buffer: u32) -> Self {
        Self {
            name: name.into(),
            buffer,
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: Rect) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// Thin bridge from a layer list to a drawn frame
///
/// Every submission is a full redraw; ordering and damage tracking are the
/// caller's business.
pub struct LayerComposer {
    renderer: Arc<Renderer>,
    frame: Rect,
    window: Arc<dyn NativeWindow>,
}

impl LayerComposer {
    pub fn new(renderer: Arc<Renderer>, frame: Rect, window: Arc<dyn NativeWindow>) -> Self {
        Self {
            renderer,
            frame,
            window,
        }
    }

    /// Draw `renderables` in order, later entries on top
    pub fn submit_layers(&self, renderables: &[Renderable]) -> bool {
        self.renderer.draw(&self.window, self.frame, renderables)
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }
}
