// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Control service
//!
//! Newline-delimited JSON on `pipe:anbox:control`, one response per
//! request line.

use std::sync::Arc;

use ananbox_render::Renderer;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::connector::ConnectionRegistry;
use crate::message_processor::MessageProcessor;
use crate::messenger::Messenger;

/// Longest request line buffered before it is rejected
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    GetStatus,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub connections: usize,
    pub color_buffers: usize,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    Status(HostStatus),
    Pong,
    Error { message: String },
}

pub struct ControlMessageProcessor {
    messenger: Arc<dyn Messenger>,
    renderer: Arc<Renderer>,
    connections: Arc<ConnectionRegistry>,
    line: Vec<u8>,
}

impl ControlMessageProcessor {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        renderer: Arc<Renderer>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            messenger,
            renderer,
            connections,
            line: Vec::new(),
        }
    }

    pub fn status(&self) -> HostStatus {
        let stats = self.renderer.stats();
        let display = self.renderer.display();
        HostStatus {
            connections: self.connections.live(),
            color_buffers: stats.color_buffers,
            frames: stats.frames,
            width: display.width,
            height: display.height,
        }
    }

    pub fn handle_line(&self, line: &[u8]) -> ControlResponse {
        match serde_json::from_slice::<ControlRequest>(line) {
            Ok(ControlRequest::GetStatus) => ControlResponse::Status(self.status()),
            Ok(ControlRequest::Ping) => ControlResponse::Pong,
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        }
    }

    fn respond(&self, response: &ControlResponse) -> bool {
        let mut text = match serde_json::to_vec(response) {
            Ok(text) => text,
            Err(e) => {
                debug!("control response encoding failed: {e}");
                return false;
            }
        };
        text.push(b'\n');
        match self.messenger.send(&text) {
            Ok(()) => true,
            Err(e) => {
                debug!("control reply failed: {e}");
                false
            }
        }
    }
}

impl MessageProcessor for ControlMessageProcessor {
    fn process_data(&mut self, data: &[u8]) -> bool {
        self.line.extend_from_slice(data);
        while let Some(end) = self.line.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line.drain(..=end).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_line(line);
            if !self.respond(&response) {
                return false;
            }
        }
        if self.line.len() > MAX_LINE_LEN {
            self.line.clear();
            return self.respond(&ControlResponse::Error {
                message: "request line too long".to_string(),
            });
        }
        true
    }
}
