// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Message processors and qemud framing
//!
//! A processor consumes the raw bytes of one connection in arrival order.
//! qemud services share the framing below: a header of four hex digits
//! giving the payload length, then the payload itself.

use std::io;
use std::sync::Arc;

use log::{debug, warn};

use crate::messenger::Messenger;
use crate::protocol::{decode_qemud_header, qemud_frame, QEMUD_END_OF_MESSAGE, QEMUD_HEADER_LEN};

/// Protocol logic for one connection
pub trait MessageProcessor: Send {
    /// Consume newly received bytes; `false` ends the connection
    fn process_data(&mut self, data: &[u8]) -> bool;

    /// The connection is over; release per-connection state
    fn close(&mut self) {}
}

/// Processor for services the host does not provide
#[derive(Debug, Default)]
pub struct NullMessageProcessor {
    discarded: usize,
}

impl NullMessageProcessor {
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl MessageProcessor for NullMessageProcessor {
    fn process_data(&mut self, data: &[u8]) -> bool {
        debug!("discarding {} bytes for unsupported service", data.len());
        self.discarded += data.len();
        true
    }
}

// ============================================================================
// qemud
// ============================================================================

/// Frame writer handed to command handlers
pub struct QemudReply<'a> {
    messenger: &'a dyn Messenger,
}

impl<'a> QemudReply<'a> {
    pub fn new(messenger: &'a dyn Messenger) -> Self {
        Self { messenger }
    }

    /// Send `payload` as one frame
    pub fn send_frame(&self, payload: &[u8]) -> io::Result<()> {
        let frame = qemud_frame(payload).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "qemud payload too large")
        })?;
        self.messenger.send(&frame)
    }

    /// Terminate a multi-frame response
    pub fn finish_message(&self) -> io::Result<()> {
        self.send_frame(QEMUD_END_OF_MESSAGE)
    }
}

/// Service logic behind the qemud framing
pub trait QemudHandler: Send {
    fn handle_command(&mut self, command: &str, reply: &QemudReply<'_>) -> io::Result<()>;
}

/// Framing state of a qemud connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QemudState {
    /// Nothing buffered
    Idle,
    /// Part of a header buffered
    AwaitingHeader,
    /// Header parsed, waiting for the payload
    AwaitingBody(usize),
    /// Connection closed
    Closed,
}

/// Splits a byte stream into qemud commands for a [`QemudHandler`]
pub struct QemudMessageProcessor<H> {
    messenger: Arc<dyn Messenger>,
    handler: H,
    buffer: Vec<u8>,
    state: QemudState,
}

impl<H: QemudHandler> QemudMessageProcessor<H> {
    pub fn new(messenger: Arc<dyn Messenger>, handler: H) -> Self {
        Self {
            messenger,
            handler,
            buffer: Vec::new(),
            state: QemudState::Idle,
        }
    }

    pub fn state(&self) -> QemudState {
        self.state
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Parse a header if enough bytes are buffered
    fn advance(&mut self) -> Option<usize> {
        match self.state {
            QemudState::AwaitingBody(len) => Some(len),
            QemudState::Closed => None,
            QemudState::Idle | QemudState::AwaitingHeader => {
                if self.buffer.is_empty() {
                    self.state = QemudState::Idle;
                    return None;
                }
                if self.buffer.len() < QEMUD_HEADER_LEN {
                    self.state = QemudState::AwaitingHeader;
                    return None;
                }
                let Some(len) = decode_qemud_header(&self.buffer[..QEMUD_HEADER_LEN]) else {
                    warn!(
                        "malformed qemud header {:?}, dropping {} buffered bytes",
                        String::from_utf8_lossy(&self.buffer[..QEMUD_HEADER_LEN]),
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    self.state = QemudState::Idle;
                    return None;
                };
                self.buffer.drain(..QEMUD_HEADER_LEN);
                self.state = QemudState::AwaitingBody(len);
                Some(len)
            }
        }
    }
}

impl<H: QemudHandler> MessageProcessor for QemudMessageProcessor<H> {
    fn process_data(&mut self, data: &[u8]) -> bool {
        if self.state == QemudState::Closed {
            return false;
        }
        self.buffer.extend_from_slice(data);

        while let Some(len) = self.advance() {
            if self.buffer.len() < len {
                break;
            }
            let payload: Vec<u8> = self.buffer.drain(..len).collect();
            self.state = QemudState::Idle;

            let text = String::from_utf8_lossy(&payload);
            let command = text.trim_end_matches('\0');
            let reply = QemudReply::new(&*self.messenger);
            if let Err(e) = self.handler.handle_command(command, &reply) {
                debug!("qemud reply failed: {e}");
                self.state = QemudState::Closed;
                return false;
            }
        }
        true
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.state = QemudState::Closed;
    }
}
