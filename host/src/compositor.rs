// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Compositor refresh
//!
//! Guests post layer lists; the refresh loop repaints the latest list at
//! the display rate, and only when something was posted since the last
//! repaint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ananbox_render::{LayerComposer, Renderable};
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

#[derive(Default)]
struct PostedLayers {
    layers: Vec<Renderable>,
    damaged: bool,
}

pub struct Compositor {
    composer: LayerComposer,
    posted: Mutex<PostedLayers>,
    repaints: AtomicU64,
}

impl Compositor {
    pub fn new(composer: LayerComposer) -> Self {
        Self {
            composer,
            posted: Mutex::new(PostedLayers::default()),
            repaints: AtomicU64::new(0),
        }
    }

    fn posted(&self) -> MutexGuard<'_, PostedLayers> {
        self.posted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the layer list shown on the next refresh
    pub fn post(&self, layers: Vec<Renderable>) {
        let mut posted = self.posted();
        posted.layers = layers;
        posted.damaged = true;
    }

    pub fn is_damaged(&self) -> bool {
        self.posted().damaged
    }

    pub fn layers(&self) -> Vec<Renderable> {
        self.posted().layers.clone()
    }

    /// Draw the last posted list now
    pub fn repaint(&self) -> bool {
        let layers = {
            let mut posted = self.posted();
            posted.damaged = false;
            posted.layers.clone()
        };
        // drawing takes the host context; the posted list stays unlocked
        let drawn = self.composer.submit_layers(&layers);
        if drawn {
            self.repaints.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("repaint of {} layers failed", layers.len());
        }
        drawn
    }

    /// Repaint if a list was posted since the last repaint
    pub fn refresh(&self) -> bool {
        if !self.is_damaged() {
            return false;
        }
        self.repaint()
    }

    pub fn repaints(&self) -> u64 {
        self.repaints.load(Ordering::Relaxed)
    }

    /// Refresh every `interval` until `shutdown` fires
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
        info!("compositor refresh every {interval:?}");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let compositor = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || compositor.refresh()).await {
                        Ok(true) => debug!("frame composed"),
                        Ok(false) => {}
                        Err(e) => warn!("refresh task failed: {e}"),
                    }
                }
            }
        }
        info!("compositor stopped");
    }
}
