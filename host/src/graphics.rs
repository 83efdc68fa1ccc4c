// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Graphics service
//!
//! Decodes the render-control subset of the guest's `pipe:opengles`
//! stream and executes it against the [`Renderer`]. Every packet is
//!
//! ```text
//! u32 opcode | u32 packet size (header included) | arguments
//! ```
//!
//! little-endian. Pixel payloads carry their own `u32` length.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ananbox_render::gles::MAX_TEXTURE_SIZE;
use ananbox_render::{FbParam, Rect, Renderable, Renderer, RendererError};
use log::{debug, warn};

use crate::compositor::Compositor;
use crate::message_processor::MessageProcessor;
use crate::messenger::Messenger;
use crate::protocol::{RenderOpcode, RENDERER_VERSION, RENDER_HEADER_LEN};

/// Largest packet accepted; a full-size RGBA upload plus arguments
pub const MAX_PACKET_LEN: usize = MAX_TEXTURE_SIZE as usize * MAX_TEXTURE_SIZE as usize * 4 + 64;

/// Decoded render-control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCommand {
    GetRendererVersion,
    GetFbParam {
        param: u32,
    },
    CreateContext {
        share: u32,
    },
    DestroyContext {
        handle: u32,
    },
    CreateWindowSurface {
        width: u32,
        height: u32,
    },
    DestroyWindowSurface {
        handle: u32,
    },
    CreateColorBuffer {
        width: u32,
        height: u32,
        format: u32,
    },
    OpenColorBuffer {
        handle: u32,
    },
    CloseColorBuffer {
        handle: u32,
    },
    BlitColorBuffer {
        handle: u32,
    },
    MakeCurrent {
        context: u32,
        draw: u32,
        read: u32,
    },
    FbPost {
        handle: u32,
    },
    BindTexture {
        handle: u32,
    },
    BindRenderbuffer {
        handle: u32,
    },
    ReadColorBuffer {
        handle: u32,
        rect: Rect,
        format: u32,
        ty: u32,
        out_len: u32,
    },
    UpdateColorBuffer {
        handle: u32,
        rect: Rect,
        format: u32,
        ty: u32,
        pixels: Vec<u8>,
    },
    PostLayers {
        handles: Vec<u32>,
    },
}

/// Turns a byte stream into render commands
pub trait CommandDecoder: Send {
    /// Append `data` and return every command completed by it
    fn decode(&mut self, data: &[u8]) -> Vec<RenderCommand>;
}

/// Little-endian argument cursor over one packet body
struct Args<'a> {
    data: &'a [u8],
}

impl<'a> Args<'a> {
    fn u32(&mut self) -> Option<u32> {
        let (head, rest) = self.data.split_first_chunk::<4>()?;
        self.data = rest;
        Some(u32::from_le_bytes(*head))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn rect(&mut self) -> Option<Rect> {
        let x = self.i32()?;
        let y = self.i32()?;
        let width = self.u32()?;
        let height = self.u32()?;
        Some(Rect::new(x, y, width, height))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Some(head)
    }
}

fn parse(opcode: RenderOpcode, body: &[u8]) -> Option<RenderCommand> {
    let mut a = Args { data: body };
    let command = match opcode {
        RenderOpcode::GetRendererVersion => RenderCommand::GetRendererVersion,
        RenderOpcode::GetFbParam => RenderCommand::GetFbParam { param: a.u32()? },
        RenderOpcode::CreateContext => RenderCommand::CreateContext { share: a.u32()? },
        RenderOpcode::DestroyContext => RenderCommand::DestroyContext { handle: a.u32()? },
        RenderOpcode::CreateWindowSurface => RenderCommand::CreateWindowSurface {
            width: a.u32()?,
            height: a.u32()?,
        },
        RenderOpcode::DestroyWindowSurface => {
            RenderCommand::DestroyWindowSurface { handle: a.u32()? }
        }
        RenderOpcode::CreateColorBuffer => RenderCommand::CreateColorBuffer {
            width: a.u32()?,
            height: a.u32()?,
            format: a.u32()?,
        },
        RenderOpcode::OpenColorBuffer => RenderCommand::OpenColorBuffer { handle: a.u32()? },
        RenderOpcode::CloseColorBuffer => RenderCommand::CloseColorBuffer { handle: a.u32()? },
        RenderOpcode::BlitColorBuffer => RenderCommand::BlitColorBuffer { handle: a.u32()? },
        RenderOpcode::MakeCurrent => RenderCommand::MakeCurrent {
            context: a.u32()?,
            draw: a.u32()?,
            read: a.u32()?,
        },
        RenderOpcode::FbPost => RenderCommand::FbPost { handle: a.u32()? },
        RenderOpcode::BindTexture => RenderCommand::BindTexture { handle: a.u32()? },
        RenderOpcode::BindRenderbuffer => RenderCommand::BindRenderbuffer { handle: a.u32()? },
        RenderOpcode::ReadColorBuffer => {
            let handle = a.u32()?;
            let rect = a.rect()?;
            let format = a.u32()?;
            let ty = a.u32()?;
            let out_len = a.u32()?;
            if out_len as usize > MAX_PACKET_LEN {
                return None;
            }
            RenderCommand::ReadColorBuffer {
                handle,
                rect,
                format,
                ty,
                out_len,
            }
        }
        RenderOpcode::UpdateColorBuffer => {
            let handle = a.u32()?;
            let rect = a.rect()?;
            let format = a.u32()?;
            let ty = a.u32()?;
            let len = a.u32()? as usize;
            RenderCommand::UpdateColorBuffer {
                handle,
                rect,
                format,
                ty,
                pixels: a.bytes(len)?.to_vec(),
            }
        }
        RenderOpcode::PostLayers => {
            let count = a.u32()? as usize;
            let handles = (0..count).map(|_| a.u32()).collect::<Option<Vec<_>>>()?;
            RenderCommand::PostLayers { handles }
        }
    };
    Some(command)
}

/// Decoder for render-control packets
///
/// Incomplete packets stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct RenderControlDecoder {
    buffer: Vec<u8>,
}

impl RenderControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for the rest of their packet
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl CommandDecoder for RenderControlDecoder {
    fn decode(&mut self, data: &[u8]) -> Vec<RenderCommand> {
        self.buffer.extend_from_slice(data);
        let mut commands = Vec::new();
        let mut offset = 0;

        while self.buffer.len() - offset >= RENDER_HEADER_LEN {
            let header = &self.buffer[offset..offset + RENDER_HEADER_LEN];
            let opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if !(RENDER_HEADER_LEN..=MAX_PACKET_LEN).contains(&size) {
                warn!(
                    "render control packet {opcode} has bad size {size}, dropping {} bytes",
                    self.buffer.len() - offset
                );
                offset = self.buffer.len();
                break;
            }
            if self.buffer.len() - offset < size {
                break;
            }

            let body = &self.buffer[offset + RENDER_HEADER_LEN..offset + size];
            match RenderOpcode::try_from(opcode) {
                Ok(op) => match parse(op, body) {
                    Some(command) => commands.push(command),
                    None => warn!("malformed {op:?} packet ({size} bytes)"),
                },
                Err(_) => debug!("skipping unknown render control opcode {opcode}"),
            }
            offset += size;
        }

        self.buffer.drain(..offset);
        commands
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Objects a connection created or opened, released when it closes
#[derive(Debug, Default)]
struct Owned {
    color_buffers: HashMap<u32, u32>,
    contexts: HashSet<u32>,
    surfaces: HashSet<u32>,
}

impl Owned {
    fn add_buffer(&mut self, handle: u32) {
        *self.color_buffers.entry(handle).or_insert(0) += 1;
    }

    /// Drop one of this connection's references; false if it holds none
    fn remove_buffer(&mut self, handle: u32) -> bool {
        let Some(refs) = self.color_buffers.get_mut(&handle) else {
            return false;
        };
        *refs -= 1;
        if *refs == 0 {
            self.color_buffers.remove(&handle);
        }
        true
    }
}

fn status(ok: bool) -> Vec<u8> {
    let code: i32 = if ok { 0 } else { -1 };
    code.to_le_bytes().to_vec()
}

fn handle_or_zero(result: Result<u32, RendererError>, what: &str) -> u32 {
    result.unwrap_or_else(|e| {
        warn!("{what}: {e}");
        0
    })
}

fn flag(result: Result<bool, RendererError>, what: &str) -> bool {
    result.unwrap_or_else(|e| {
        warn!("{what}: {e}");
        false
    })
}

/// Processor for `pipe:opengles` connections
pub struct GraphicsMessageProcessor {
    messenger: Arc<dyn Messenger>,
    decoder: Box<dyn CommandDecoder>,
    renderer: Arc<Renderer>,
    compositor: Arc<Compositor>,
    owned: Owned,
    bound: bool,
}

impl GraphicsMessageProcessor {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        renderer: Arc<Renderer>,
        compositor: Arc<Compositor>,
    ) -> Self {
        Self::with_decoder(
            messenger,
            Box::new(RenderControlDecoder::new()),
            renderer,
            compositor,
        )
    }

    pub fn with_decoder(
        messenger: Arc<dyn Messenger>,
        decoder: Box<dyn CommandDecoder>,
        renderer: Arc<Renderer>,
        compositor: Arc<Compositor>,
    ) -> Self {
        Self {
            messenger,
            decoder,
            renderer,
            compositor,
            owned: Owned::default(),
            bound: false,
        }
    }

    /// Run one command, returning its reply bytes
    pub fn execute(&mut self, command: RenderCommand) -> Option<Vec<u8>> {
        let r = &self.renderer;
        match command {
            RenderCommand::GetRendererVersion => Some(RENDERER_VERSION.to_le_bytes().to_vec()),
            RenderCommand::GetFbParam { param } => {
                let value = FbParam::try_from(param)
                    .map(|p| r.fb_param(p))
                    .unwrap_or_else(|e| {
                        debug!("{e}: {param}");
                        0
                    });
                Some(value.to_le_bytes().to_vec())
            }
            RenderCommand::CreateContext { share } => {
                let handle = handle_or_zero(r.create_context(share), "create context");
                if handle != 0 {
                    self.owned.contexts.insert(handle);
                }
                Some(handle.to_le_bytes().to_vec())
            }
            RenderCommand::DestroyContext { handle } => {
                if self.owned.contexts.remove(&handle) {
                    if let Err(e) = r.destroy_context(handle) {
                        warn!("destroy context: {e}");
                    }
                } else {
                    debug!("context {handle} is not owned by this connection");
                }
                None
            }
            RenderCommand::CreateWindowSurface { width, height } => {
                let handle =
                    handle_or_zero(r.create_window_surface(width, height), "create surface");
                if handle != 0 {
                    self.owned.surfaces.insert(handle);
                }
                Some(handle.to_le_bytes().to_vec())
            }
            RenderCommand::DestroyWindowSurface { handle } => {
                if self.owned.surfaces.remove(&handle) {
                    if let Err(e) = r.destroy_window_surface(handle) {
                        warn!("destroy surface: {e}");
                    }
                } else {
                    debug!("surface {handle} is not owned by this connection");
                }
                None
            }
            RenderCommand::CreateColorBuffer {
                width,
                height,
                format,
            } => {
                let handle = handle_or_zero(
                    r.create_color_buffer(width, height, format),
                    "create color buffer",
                );
                if handle != 0 {
                    self.owned.add_buffer(handle);
                }
                Some(handle.to_le_bytes().to_vec())
            }
            RenderCommand::OpenColorBuffer { handle } => {
                match r.open_color_buffer(handle) {
                    Ok(()) => self.owned.add_buffer(handle),
                    Err(e) => warn!("open color buffer: {e}"),
                }
                None
            }
            RenderCommand::CloseColorBuffer { handle } => {
                if self.owned.remove_buffer(handle) {
                    if let Err(e) = r.close_color_buffer(handle) {
                        warn!("close color buffer: {e}");
                    }
                } else {
                    debug!("color buffer {handle} is not held by this connection");
                }
                None
            }
            RenderCommand::BlitColorBuffer { handle } => Some(status(flag(
                r.blit_from_current_read_buffer(handle),
                "blit color buffer",
            ))),
            RenderCommand::MakeCurrent {
                context,
                draw,
                read,
            } => {
                let ok = flag(r.make_current(context, draw, read), "make current");
                self.bound = ok && context != 0;
                Some(u32::from(ok).to_le_bytes().to_vec())
            }
            RenderCommand::FbPost { handle } => {
                self.compositor
                    .post(vec![Renderable::new("framebuffer", handle)]);
                None
            }
            RenderCommand::BindTexture { handle } => Some(status(flag(
                r.bind_color_buffer_to_texture(handle),
                "bind texture",
            ))),
            RenderCommand::BindRenderbuffer { handle } => Some(status(flag(
                r.bind_color_buffer_to_renderbuffer(handle),
                "bind renderbuffer",
            ))),
            RenderCommand::ReadColorBuffer {
                handle,
                rect,
                format,
                ty,
                out_len,
            } => {
                let mut out = vec![0u8; out_len as usize];
                if !flag(
                    r.read_color_buffer(handle, rect, format, ty, &mut out),
                    "read color buffer",
                ) {
                    out.fill(0);
                }
                Some(out)
            }
            RenderCommand::UpdateColorBuffer {
                handle,
                rect,
                format,
                ty,
                pixels,
            } => Some(status(flag(
                r.update_color_buffer(handle, rect, format, ty, &pixels),
                "update color buffer",
            ))),
            RenderCommand::PostLayers { handles } => {
                let layers = handles
                    .into_iter()
                    .enumerate()
                    .map(|(i, handle)| Renderable::new(format!("layer{i}"), handle))
                    .collect();
                self.compositor.post(layers);
                None
            }
        }
    }

    fn release_owned(&mut self) {
        let r = &self.renderer;
        if self.bound {
            if let Err(e) = r.make_current(0, 0, 0) {
                debug!("unbind on close: {e}");
            }
            self.bound = false;
        }
        for (handle, refs) in self.owned.color_buffers.drain() {
            for _ in 0..refs {
                if let Err(e) = r.close_color_buffer(handle) {
                    debug!("release color buffer: {e}");
                    break;
                }
            }
        }
        for handle in self.owned.contexts.drain() {
            if let Err(e) = r.destroy_context(handle) {
                debug!("release context: {e}");
            }
        }
        for handle in self.owned.surfaces.drain() {
            if let Err(e) = r.destroy_window_surface(handle) {
                debug!("release surface: {e}");
            }
        }
    }
}

impl MessageProcessor for GraphicsMessageProcessor {
    fn process_data(&mut self, data: &[u8]) -> bool {
        for command in self.decoder.decode(data) {
            let Some(reply) = self.execute(command) else {
                continue;
            };
            if let Err(e) = self.messenger.send(&reply) {
                debug!("graphics reply failed: {e}");
                return false;
            }
        }
        true
    }

    fn close(&mut self) {
        self.release_owned();
    }
}

impl Drop for GraphicsMessageProcessor {
    fn drop(&mut self) {
        self.release_owned();
    }
}

#[cfg(test)]
mod tests {
    use ananbox_render::gles::format::GL_RGBA;
    use ananbox_render::{DisplayInfo, LayerComposer, SoftwareDriver};

    use super::*;
    use crate::shm::HeadlessWindow;

    fn packet(opcode: u32, args: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&opcode.to_le_bytes());
        out.extend_from_slice(&((RENDER_HEADER_LEN + args.len() * 4) as u32).to_le_bytes());
        for arg in args {
            out.extend_from_slice(&arg.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decode_simple_packets() {
        let mut decoder = RenderControlDecoder::new();
        let mut data = packet(10000, &[]);
        data.extend(packet(10012, &[64, 32, 0x1908]));
        assert_eq!(
            decoder.decode(&data),
            [
                RenderCommand::GetRendererVersion,
                RenderCommand::CreateColorBuffer {
                    width: 64,
                    height: 32,
                    format: 0x1908
                }
            ]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_packet_is_buffered() {
        let mut decoder = RenderControlDecoder::new();
        let data = packet(10017, &[1, 2, 3]);
        assert!(decoder.decode(&data[..5]).is_empty());
        assert!(decoder.decode(&data[5..12]).is_empty());
        assert_eq!(decoder.pending(), 12);
        assert_eq!(
            decoder.decode(&data[12..]),
            [RenderCommand::MakeCurrent {
                context: 1,
                draw: 2,
                read: 3
            }]
        );
    }

    #[test]
    fn test_unknown_opcode_is_skipped() {
        let mut decoder = RenderControlDecoder::new();
        let mut data = packet(10999, &[1, 2, 3, 4]);
        data.extend(packet(10014, &[9]));
        assert_eq!(
            decoder.decode(&data),
            [RenderCommand::CloseColorBuffer { handle: 9 }]
        );
    }

    #[test]
    fn test_short_arguments_are_dropped() {
        let mut decoder = RenderControlDecoder::new();
        let mut data = packet(10012, &[64]);
        data.extend(packet(10013, &[5]));
        assert_eq!(
            decoder.decode(&data),
            [RenderCommand::OpenColorBuffer { handle: 5 }]
        );
    }

    #[test]
    fn test_bad_size_drops_buffer() {
        let mut decoder = RenderControlDecoder::new();
        let mut data = Vec::new();
        data.extend_from_slice(&10000u32.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend(packet(10000, &[]));
        assert!(decoder.decode(&data).is_empty());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_update_and_post_layers() {
        let mut decoder = RenderControlDecoder::new();
        let mut data = packet(10024, &[3, 1, 2, 1, 1, 0x1908, 0x1401, 4]);
        data.extend_from_slice(&[1, 2, 3, 4]);
        let size = data.len() as u32;
        data[4..8].copy_from_slice(&size.to_le_bytes());
        data.extend(packet(10030, &[2, 7, 8]));

        assert_eq!(
            decoder.decode(&data),
            [
                RenderCommand::UpdateColorBuffer {
                    handle: 3,
                    rect: Rect::new(1, 2, 1, 1),
                    format: 0x1908,
                    ty: 0x1401,
                    pixels: vec![1, 2, 3, 4],
                },
                RenderCommand::PostLayers {
                    handles: vec![7, 8]
                }
            ]
        );
    }

    #[test]
    fn test_owned_buffer_counts() {
        let mut owned = Owned::default();
        owned.add_buffer(4);
        owned.add_buffer(4);
        assert!(owned.remove_buffer(4));
        assert_eq!(owned.color_buffers.get(&4), Some(&1));
        assert!(owned.remove_buffer(4));
        assert!(!owned.remove_buffer(4));
        assert!(owned.color_buffers.is_empty());
    }

    struct Sink;

    impl Messenger for Sink {
        fn send(&self, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn receive(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn processors(count: usize) -> (Arc<Renderer>, Vec<GraphicsMessageProcessor>) {
        let renderer = Arc::new(
            Renderer::new(
                Arc::new(SoftwareDriver::new()),
                DisplayInfo {
                    width: 16,
                    height: 16,
                    ..DisplayInfo::default()
                },
            )
            .unwrap(),
        );
        let composer = LayerComposer::new(
            Arc::clone(&renderer),
            Rect::full(16, 16),
            Arc::new(HeadlessWindow::new(16, 16)),
        );
        let compositor = Arc::new(Compositor::new(composer));
        let processors = (0..count)
            .map(|_| {
                GraphicsMessageProcessor::new(
                    Arc::new(Sink),
                    Arc::clone(&renderer),
                    Arc::clone(&compositor),
                )
            })
            .collect();
        (renderer, processors)
    }

    fn reply_u32(reply: Option<Vec<u8>>) -> u32 {
        u32::from_le_bytes(reply.unwrap().try_into().unwrap())
    }

    #[test]
    fn test_foreign_close_is_ignored() {
        let (renderer, mut p) = processors(3);
        let handle = reply_u32(p[0].execute(RenderCommand::CreateColorBuffer {
            width: 4,
            height: 4,
            format: GL_RGBA,
        }));
        assert_ne!(handle, 0);
        p[2].execute(RenderCommand::OpenColorBuffer { handle });

        // a connection that never took a reference cannot drop one
        p[1].execute(RenderCommand::CloseColorBuffer { handle });
        p[1].execute(RenderCommand::CloseColorBuffer { handle });
        assert!(renderer.color_buffer(handle).is_some());

        p[0].execute(RenderCommand::CloseColorBuffer { handle });
        assert!(renderer.color_buffer(handle).is_some());
        p[2].close();
        assert!(renderer.color_buffer(handle).is_none());
    }

    #[test]
    fn test_foreign_destroy_is_ignored() {
        let (renderer, mut p) = processors(2);
        let context = reply_u32(p[0].execute(RenderCommand::CreateContext { share: 0 }));
        let surface = reply_u32(p[0].execute(RenderCommand::CreateWindowSurface {
            width: 8,
            height: 8,
        }));
        p[1].execute(RenderCommand::DestroyContext { handle: context });
        p[1].execute(RenderCommand::DestroyWindowSurface { handle: surface });
        let stats = renderer.stats();
        assert_eq!((stats.contexts, stats.surfaces), (1, 1));

        p[0].close();
        let stats = renderer.stats();
        assert_eq!((stats.contexts, stats.surfaces), (0, 0));
    }

    #[test]
    fn test_oversized_creates_return_zero() {
        let (renderer, mut p) = processors(1);
        let mut data = packet(10012, &[u32::MAX, u32::MAX, GL_RGBA]);
        data.extend(packet(10012, &[46341, 46341, GL_RGBA]));
        data.extend(packet(10010, &[u32::MAX, 2]));
        let commands = p[0].decoder.decode(&data);
        let replies: Vec<u32> = commands
            .into_iter()
            .map(|command| reply_u32(p[0].execute(command)))
            .collect();
        assert_eq!(replies, [0, 0, 0]);
        let stats = renderer.stats();
        assert_eq!((stats.color_buffers, stats.surfaces), (0, 0));
    }
}
