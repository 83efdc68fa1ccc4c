// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Presentation windows
//!
//! [`ShmWindow`] publishes every presented frame into a memory-mapped file
//! that a viewer process maps read-only. Frames go into the slot after the
//! active one and are then committed by publishing the slot index and
//! bumping the frame counter with release ordering.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ananbox_render::{Frame, NativeWindow};
use log::{debug, warn};
use memmap2::MmapMut;

use crate::protocol::*;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

fn window_id() -> u64 {
    NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed)
}

/// Window that drops every frame
pub struct HeadlessWindow {
    id: u64,
    width: u32,
    height: u32,
    frames: AtomicU64,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            id: window_id(),
            width,
            height,
            frames: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl NativeWindow for HeadlessWindow {
    fn raw_handle(&self) -> u64 {
        self.id
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn present(&self, _frame: &Frame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Window backed by a shared-memory presentation file
pub struct ShmWindow {
    id: u64,
    /// Writers serialize on the mapping; readers use the header atomics
    mmap: Mutex<MmapMut>,
    width: u32,
    height: u32,
    buffer_count: u32,
    buffer_size: usize,
    /// Created the file, as opposed to mapping an existing one
    owner: bool,
}

impl ShmWindow {
    /// Create (or truncate) `path` for frames of `width` x `height`
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> io::Result<Self> {
        if width == 0 || height == 0 || buffer_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "presentation needs a non-empty frame and at least one buffer",
            ));
        }
        let buffer_size = width as usize * height as usize * 4;
        let buffer_size_u32 = u32::try_from(buffer_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let total = PRESENT_HEADER_SIZE + buffer_size * buffer_count as usize;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: the file was just sized and stays open for the map's
        // lifetime; concurrent readers only touch the header atomics and
        // committed slots.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = PresentHeader {
            magic: PRESENT_MAGIC,
            version: PRESENT_VERSION,
            buffer_count,
            buffer_size: buffer_size_u32,
            width,
            height,
            active_index: 0,
            flags: 0,
            frame_count: 0,
        };
        // SAFETY: the mapping is at least PRESENT_HEADER_SIZE bytes and page
        // aligned, which satisfies PresentHeader's size and alignment.
        unsafe { std::ptr::write(mmap.as_mut_ptr() as *mut PresentHeader, header) };

        let window = Self {
            id: window_id(),
            mmap: Mutex::new(mmap),
            width,
            height,
            buffer_count,
            buffer_size,
            owner: true,
        };
        window.set_flags(PresentFlags::HOST_READY);
        debug!("presentation file ready: {width}x{height}, {buffer_count} buffers");
        Ok(window)
    }

    /// Map an existing presentation file
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(&file)
    }

    fn from_file(file: &File) -> io::Result<Self> {
        // SAFETY: the file stays mapped for the lifetime of the window and is
        // validated before any slot is touched.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        if mmap.len() < PRESENT_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "presentation file too small",
            ));
        }
        // SAFETY: the length was checked above and the mapping is page aligned.
        let header = unsafe { &*(mmap.as_ptr() as *const PresentHeader) };
        if header.magic != PRESENT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic number",
            ));
        }
        if header.version != PRESENT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported version: {}", header.version),
            ));
        }
        let (width, height, buffer_count) = (header.width, header.height, header.buffer_count);
        let buffer_size = header.buffer_size as usize;
        if buffer_size != width as usize * height as usize * 4
            || buffer_count == 0
            || mmap.len() < PRESENT_HEADER_SIZE + buffer_size * buffer_count as usize
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "presentation header does not match file",
            ));
        }
        Ok(Self {
            id: window_id(),
            mmap: Mutex::new(mmap),
            width,
            height,
            buffer_count,
            buffer_size,
            owner: false,
        })
    }

    fn mapping(&self) -> MutexGuard<'_, MmapMut> {
        self.mmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn header_ptr(mmap: &MmapMut) -> *const PresentHeader {
        mmap.as_ptr() as *const PresentHeader
    }

    fn active_atomic(mmap: &MmapMut) -> &AtomicU32 {
        let header_ptr = Self::header_ptr(mmap);
        // SAFETY: the header lives at the start of the mapping, the field is
        // 4-byte aligned and only ever accessed atomically after creation.
        unsafe { &*(&raw const (*header_ptr).active_index as *const AtomicU32) }
    }

    fn flags_atomic(mmap: &MmapMut) -> &AtomicU32 {
        let header_ptr = Self::header_ptr(mmap);
        // SAFETY: as for `active_atomic`.
        unsafe { &*(&raw const (*header_ptr).flags as *const AtomicU32) }
    }

    fn count_atomic(mmap: &MmapMut) -> &AtomicU64 {
        let header_ptr = Self::header_ptr(mmap);
        // SAFETY: the header is page aligned, so the u64 at offset 32 is
        // 8-byte aligned; it is only ever accessed atomically.
        unsafe { &*(&raw const (*header_ptr).frame_count as *const AtomicU64) }
    }

    fn set_flags(&self, flags: PresentFlags) {
        let mmap = self.mapping();
        Self::flags_atomic(&mmap).fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn flags(&self) -> PresentFlags {
        let mmap = self.mapping();
        PresentFlags::from_bits_truncate(Self::flags_atomic(&mmap).load(Ordering::Acquire))
    }

    pub fn active_index(&self) -> u32 {
        let mmap = self.mapping();
        Self::active_atomic(&mmap).load(Ordering::Acquire)
    }

    pub fn frame_count(&self) -> u64 {
        let mmap = self.mapping();
        Self::count_atomic(&mmap).load(Ordering::Acquire)
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    fn slot_range(&self, index: u32) -> std::ops::Range<usize> {
        let start = PRESENT_HEADER_SIZE + index as usize * self.buffer_size;
        start..start + self.buffer_size
    }

    /// Write `pixels` into the next slot and commit it
    pub fn write_frame(&self, pixels: &[u8]) -> io::Result<u64> {
        if pixels.len() != self.buffer_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame is {} bytes, slots hold {}",
                    pixels.len(),
                    self.buffer_size
                ),
            ));
        }
        let mut mmap = self.mapping();
        let next = (Self::active_atomic(&mmap).load(Ordering::Acquire) + 1) % self.buffer_count;
        let range = self.slot_range(next);
        mmap[range].copy_from_slice(pixels);

        Self::active_atomic(&mmap).store(next, Ordering::Release);
        let count = Self::count_atomic(&mmap).fetch_add(1, Ordering::AcqRel) + 1;
        Self::flags_atomic(&mmap).fetch_or(PresentFlags::FRAME_VALID.bits(), Ordering::AcqRel);
        Ok(count)
    }

    /// The most recently committed frame
    pub fn latest_frame(&self) -> Option<Frame> {
        let mmap = self.mapping();
        let flags = PresentFlags::from_bits_truncate(
            Self::flags_atomic(&mmap).load(Ordering::Acquire),
        );
        if !flags.contains(PresentFlags::FRAME_VALID) {
            return None;
        }
        let active = Self::active_atomic(&mmap).load(Ordering::Acquire) % self.buffer_count;
        Some(Frame {
            width: self.width,
            height: self.height,
            pixels: mmap[self.slot_range(active)].to_vec(),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.mapping().flush()
    }
}

impl NativeWindow for ShmWindow {
    fn raw_handle(&self) -> u64 {
        self.id
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn present(&self, frame: &Frame) {
        if (frame.width, frame.height) != (self.width, self.height) {
            warn!(
                "dropping {}x{} frame for {}x{} presentation",
                frame.width, frame.height, self.width, self.height
            );
            return;
        }
        if let Err(e) = self.write_frame(&frame.pixels) {
            warn!("failed to publish frame: {e}");
        }
    }
}

impl Drop for ShmWindow {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        self.set_flags(PresentFlags::SHUTDOWN);
        if let Err(e) = self.flush() {
            debug!("presentation flush failed: {e}");
        }
    }
}
