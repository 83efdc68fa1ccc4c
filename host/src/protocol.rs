// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Wire definitions shared with the guest
//!
//! Service names announced on a fresh pipe connection, the qemud frame
//! header, the render-control opcode table and the layout of the
//! shared-memory presentation file.

/// OpenGL ES render-control stream
pub const SERVICE_OPENGLES: &str = "pipe:opengles";

/// qemud boot-properties service
pub const SERVICE_BOOT_PROPERTIES: &str = "pipe:qemud:boot-properties";

/// JSON control channel
pub const SERVICE_CONTROL: &str = "pipe:anbox:control";

/// Longest service name accepted before the terminating NUL
pub const MAX_SERVICE_NAME_LEN: usize = 256;

// ============================================================================
// qemud framing
// ============================================================================

/// Length of a qemud header: four hex digits
pub const QEMUD_HEADER_LEN: usize = 4;

/// Largest payload a qemud header can describe
pub const QEMUD_MAX_PAYLOAD: usize = 0xffff;

/// Payload of the frame that ends a multi-frame response
pub const QEMUD_END_OF_MESSAGE: &[u8] = b"\0";

/// Encode a qemud header for a payload of `len` bytes
pub fn encode_qemud_header(len: usize) -> Option<[u8; QEMUD_HEADER_LEN]> {
    if len > QEMUD_MAX_PAYLOAD {
        return None;
    }
    let text = format!("{len:04x}");
    let mut header = [0u8; QEMUD_HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Some(header)
}

/// Decode a qemud header, `None` if it is not four hex digits
pub fn decode_qemud_header(header: &[u8]) -> Option<usize> {
    if header.len() != QEMUD_HEADER_LEN || !header.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// Header followed by payload, ready for a single send
pub fn qemud_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let header = encode_qemud_header(payload.len())?;
    let mut frame = Vec::with_capacity(QEMUD_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Some(frame)
}

// ============================================================================
// Render control
// ============================================================================

/// Render-control packet header: opcode then total packet size
pub const RENDER_HEADER_LEN: usize = 8;

/// Version reported to guests
pub const RENDERER_VERSION: u32 = 1;

/// Render-control opcodes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOpcode {
    GetRendererVersion = 10000,
    GetFbParam = 10007,
    CreateContext = 10008,
    DestroyContext = 10009,
    CreateWindowSurface = 10010,
    DestroyWindowSurface = 10011,
    CreateColorBuffer = 10012,
    OpenColorBuffer = 10013,
    CloseColorBuffer = 10014,
    BlitColorBuffer = 10016,
    MakeCurrent = 10017,
    FbPost = 10018,
    BindTexture = 10020,
    BindRenderbuffer = 10021,
    ReadColorBuffer = 10023,
    UpdateColorBuffer = 10024,
    PostLayers = 10030,
}

impl TryFrom<u32> for RenderOpcode {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10000 => Ok(RenderOpcode::GetRendererVersion),
            10007 => Ok(RenderOpcode::GetFbParam),
            10008 => Ok(RenderOpcode::CreateContext),
            10009 => Ok(RenderOpcode::DestroyContext),
            10010 => Ok(RenderOpcode::CreateWindowSurface),
            10011 => Ok(RenderOpcode::DestroyWindowSurface),
            10012 => Ok(RenderOpcode::CreateColorBuffer),
            10013 => Ok(RenderOpcode::OpenColorBuffer),
            10014 => Ok(RenderOpcode::CloseColorBuffer),
            10016 => Ok(RenderOpcode::BlitColorBuffer),
            10017 => Ok(RenderOpcode::MakeCurrent),
            10018 => Ok(RenderOpcode::FbPost),
            10020 => Ok(RenderOpcode::BindTexture),
            10021 => Ok(RenderOpcode::BindRenderbuffer),
            10023 => Ok(RenderOpcode::ReadColorBuffer),
            10024 => Ok(RenderOpcode::UpdateColorBuffer),
            10030 => Ok(RenderOpcode::PostLayers),
            _ => Err("Unknown render control opcode"),
        }
    }
}

// ============================================================================
// Shared-memory presentation
// ============================================================================

/// Magic number for presentation header validation: "ANBX"
pub const PRESENT_MAGIC: u32 = u32::from_le_bytes(*b"ANBX");

/// Current presentation layout version
pub const PRESENT_VERSION: u32 = 1;

/// Default number of frame slots (double buffering)
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Frame slots start at this offset
pub const PRESENT_HEADER_SIZE: usize = 64;

bitflags::bitflags! {
    /// Presentation state flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        /// The host has initialized the header
        const HOST_READY = 1 << 0;
        /// At least one frame has been committed
        const FRAME_VALID = 1 << 1;
        /// The host is shutting down
        const SHUTDOWN = 1 << 2;
    }
}

/// Header at the start of the presentation file
///
/// Frames are RGBA8, top row first, `width * 4` bytes per row.
#[repr(C)]
#[derive(Debug)]
pub struct PresentHeader {
    /// Magic: "ANBX"
    pub magic: u32,
    /// Layout version
    pub version: u32,
    /// Number of frame slots
    pub buffer_count: u32,
    /// Size of one frame slot in bytes
    pub buffer_size: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Slot holding the latest committed frame (atomic)
    pub active_index: u32,
    /// `PresentFlags` bits (atomic)
    pub flags: u32,
    /// Committed frames (atomic)
    pub frame_count: u64,
}

const _: () = assert!(std::mem::size_of::<PresentHeader>() <= PRESENT_HEADER_SIZE);
