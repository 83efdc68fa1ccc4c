// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Render thread context guard
//!
//! GPU work is only valid while the host context is current on the calling
//! thread. [`ScopedContext`] binds a [`ContextBinder`] for the lifetime of the
//! scope and tears it down on every exit path; [`with_context`] is the closure
//! form.
//!
//! [`HostContext`] is the binder used by the renderer. It serializes host
//! context use across worker threads and is re-entrant within a thread, so a
//! color buffer operation may call into the texture compositor (which acquires
//! again) without deadlocking.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::{error, warn};

use crate::gles::{Binding, ContextId, GlesDriver, SurfaceId};

/// Something that can bind and unbind a rendering context
pub trait ContextBinder: Send + Sync {
    /// Make the context current on the calling thread
    fn setup_context(&self) -> bool;

    /// Undo `setup_context`; must tolerate being called after a failed setup
    fn teardown_context(&self);
}

/// Scoped context acquisition
///
/// The context is torn down when the guard is released or dropped, whether
/// or not setup succeeded.
pub struct ScopedContext<'a, B: ContextBinder + ?Sized> {
    binder: &'a B,
    ok: bool,
    released: bool,
}

impl<'a, B: ContextBinder + ?Sized> ScopedContext<'a, B> {
    pub fn new(binder: &'a B) -> Self {
        let ok = binder.setup_context();
        Self {
            binder,
            ok,
            released: false,
        }
    }

    /// Whether the context was bound
    pub fn is_ok(&self) -> bool {
        self.ok && !self.released
    }

    /// Tear down now; further calls do nothing
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.binder.teardown_context();
        }
    }
}

impl<B: ContextBinder + ?Sized> Drop for ScopedContext<'_, B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run `f` with the context bound; `None` if it could not be bound
pub fn with_context<B, R>(binder: &B, f: impl FnOnce() -> R) -> Option<R>
where
    B: ContextBinder + ?Sized,
{
    let scope = ScopedContext::new(binder);
    if !scope.is_ok() {
        return None;
    }
    Some(f())
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
    saved: Binding,
}

/// The renderer's own context, bound to a 1x1 pbuffer by default
pub struct HostContext {
    driver: Arc<dyn GlesDriver>,
    context: ContextId,
    pbuffer: SurfaceId,
    owner: Mutex<Owner>,
    available: Condvar,
}

impl HostContext {
    /// Create the host context; `None` if the driver refuses
    pub fn new(driver: Arc<dyn GlesDriver>) -> Option<Self> {
        let context = driver.create_context(ContextId::NULL);
        if context.is_null() {
            error!("failed to create host context");
            return None;
        }
        let pbuffer = driver.create_pbuffer_surface(1, 1);
        if pbuffer.is_null() {
            error!("failed to create host pbuffer surface");
            driver.destroy_context(context);
            return None;
        }
        Some(Self {
            driver,
            context,
            pbuffer,
            owner: Mutex::new(Owner::default()),
            available: Condvar::new(),
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn driver(&self) -> &Arc<dyn GlesDriver> {
        &self.driver
    }

    /// Binder targeting `surface` instead of the pbuffer
    ///
    /// Nested acquisitions on the same thread keep whatever surface the
    /// outermost acquisition bound.
    pub fn bind_surface(&self, surface: SurfaceId) -> SurfaceBinder<'_> {
        SurfaceBinder {
            host: self,
            surface,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Owner> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, surface: SurfaceId) -> bool {
        let me = thread::current().id();
        let mut owner = self.lock();
        loop {
            match owner.thread {
                Some(thread) if thread == me => {
                    owner.depth += 1;
                    return true;
                }
                Some(_) => {
                    owner = self
                        .available
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }

        let saved = self.driver.current_binding();
        let binding = Binding {
            draw: surface,
            read: surface,
            context: self.context,
        };
        if !self.driver.make_current(binding) {
            warn!("failed to bind host context to surface {surface}");
            return false;
        }
        owner.thread = Some(me);
        owner.depth = 1;
        owner.saved = saved;
        true
    }

    fn release(&self) {
        let me = thread::current().id();
        let mut owner = self.lock();
        if owner.thread != Some(me) {
            return;
        }
        owner.depth -= 1;
        if owner.depth > 0 {
            return;
        }
        let saved = std::mem::take(&mut owner.saved);
        let restored = !saved.context.is_null() && self.driver.make_current(saved);
        if !restored {
            self.driver.release_current();
        }
        owner.thread = None;
        drop(owner);
        self.available.notify_one();
    }
}

impl ContextBinder for HostContext {
    fn setup_context(&self) -> bool {
        self.acquire(self.pbuffer)
    }

    fn teardown_context(&self) {
        self.release();
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.driver.destroy_surface(self.pbuffer);
        self.driver.destroy_context(self.context);
    }
}

/// [`HostContext`] binder for a window surface
pub struct SurfaceBinder<'a> {
    host: &'a HostContext,
    surface: SurfaceId,
}

impl ContextBinder for SurfaceBinder<'_> {
    fn setup_context(&self) -> bool {
        self.host.acquire(self.surface)
    }

    fn teardown_context(&self) {
        self.host.release();
    }
}
