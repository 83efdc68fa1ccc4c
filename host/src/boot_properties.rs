// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! qemud boot-properties service
//!
//! The guest sends `list` during boot and receives one `key=value` frame
//! per property followed by the end-of-message frame.

use std::io;
use std::sync::Arc;

use log::debug;

use crate::config::HostConfig;
use crate::message_processor::{QemudHandler, QemudMessageProcessor, QemudReply};
use crate::messenger::Messenger;

/// Host-derived values published to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootProperties {
    pub lcd_density: u32,
    pub api_level: u32,
    pub use_memfd: bool,
}

impl BootProperties {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            lcd_density: config.dpi,
            api_level: config.api_level,
            use_memfd: config.memfd_enabled(),
        }
    }

    /// `key=value` lines in the order they are sent
    pub fn entries(&self) -> Vec<String> {
        vec![
            format!("ro.sf.lcd_density={}", self.lcd_density),
            format!("ro.ananbox.host.api_level={}", self.api_level),
            format!("sys.use_memfd={}", u8::from(self.use_memfd)),
        ]
    }
}

/// Answers `list`; everything else is ignored
pub struct BootPropertiesHandler {
    properties: BootProperties,
}

impl BootPropertiesHandler {
    pub fn new(properties: BootProperties) -> Self {
        Self { properties }
    }

    fn list_properties(&self, reply: &QemudReply<'_>) -> io::Result<()> {
        for entry in self.properties.entries() {
            reply.send_frame(entry.as_bytes())?;
        }
        reply.finish_message()
    }
}

impl QemudHandler for BootPropertiesHandler {
    fn handle_command(&mut self, command: &str, reply: &QemudReply<'_>) -> io::Result<()> {
        if command == "list" {
            return self.list_properties(reply);
        }
        debug!("boot-properties: ignoring command {command:?}");
        Ok(())
    }
}

pub type BootPropertiesMessageProcessor = QemudMessageProcessor<BootPropertiesHandler>;

pub fn boot_properties_processor(
    messenger: Arc<dyn Messenger>,
    properties: BootProperties,
) -> BootPropertiesMessageProcessor {
    QemudMessageProcessor::new(messenger, BootPropertiesHandler::new(properties))
}
