// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Pipe connection creator
//!
//! A qemu pipe connection opens with the NUL-terminated name of the
//! service it wants. Bytes that follow the NUL in the same read belong to
//! that service.

use std::sync::Arc;

use ananbox_render::Renderer;
use log::{debug, info, warn};

use crate::boot_properties::{boot_properties_processor, BootProperties};
use crate::compositor::Compositor;
use crate::connector::{ConnectionCreator, ConnectionRegistry};
use crate::control::ControlMessageProcessor;
use crate::graphics::GraphicsMessageProcessor;
use crate::message_processor::{MessageProcessor, NullMessageProcessor};
use crate::messenger::Messenger;
use crate::protocol::{
    MAX_SERVICE_NAME_LEN, SERVICE_BOOT_PROPERTIES, SERVICE_CONTROL, SERVICE_OPENGLES,
};

/// Services a pipe may ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    OpenGles,
    BootProperties,
    Control,
    Unsupported(String),
}

impl ServiceKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            SERVICE_OPENGLES => ServiceKind::OpenGles,
            SERVICE_BOOT_PROPERTIES => ServiceKind::BootProperties,
            SERVICE_CONTROL => ServiceKind::Control,
            other => ServiceKind::Unsupported(other.to_string()),
        }
    }
}

/// Read the service name, returning it with any bytes received after it
pub fn read_service_name(messenger: &dyn Messenger) -> Option<(String, Vec<u8>)> {
    let mut received = Vec::new();
    let mut buf = [0u8; MAX_SERVICE_NAME_LEN + 1];
    loop {
        if let Some(end) = received.iter().position(|&b| b == 0) {
            let rest = received.split_off(end + 1);
            received.truncate(end);
            let name = String::from_utf8_lossy(&received).into_owned();
            return Some((name, rest));
        }
        if received.len() > MAX_SERVICE_NAME_LEN {
            warn!("service name longer than {MAX_SERVICE_NAME_LEN} bytes, dropping connection");
            return None;
        }
        match messenger.receive(&mut buf) {
            Ok(0) => {
                debug!("connection closed before naming a service");
                return None;
            }
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("reading service name failed: {e}");
                return None;
            }
        }
    }
}

/// Shared state every service is built from
#[derive(Clone)]
pub struct Services {
    pub renderer: Arc<Renderer>,
    pub compositor: Arc<Compositor>,
    pub boot_properties: BootProperties,
    pub connections: Arc<ConnectionRegistry>,
}

pub struct PipeConnectionCreator {
    services: Services,
}

impl PipeConnectionCreator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Processor for `kind`, bound to `messenger`
    pub fn processor_for(
        &self,
        kind: &ServiceKind,
        messenger: Arc<dyn Messenger>,
    ) -> Box<dyn MessageProcessor> {
        let s = &self.services;
        match kind {
            ServiceKind::OpenGles => Box::new(GraphicsMessageProcessor::new(
                messenger,
                Arc::clone(&s.renderer),
                Arc::clone(&s.compositor),
            )),
            ServiceKind::BootProperties => {
                Box::new(boot_properties_processor(messenger, s.boot_properties))
            }
            ServiceKind::Control => Box::new(ControlMessageProcessor::new(
                messenger,
                Arc::clone(&s.renderer),
                Arc::clone(&s.connections),
            )),
            ServiceKind::Unsupported(name) => {
                debug!("no service for {name:?}");
                Box::new(NullMessageProcessor::default())
            }
        }
    }
}

impl ConnectionCreator for PipeConnectionCreator {
    fn create_processor(&self, messenger: Arc<dyn Messenger>) -> Option<Box<dyn MessageProcessor>> {
        let (name, rest) = read_service_name(&*messenger)?;
        let kind = ServiceKind::from_name(&name);
        info!("pipe connection for {name:?}");

        let mut processor = self.processor_for(&kind, messenger);
        if !rest.is_empty() && !processor.process_data(&rest) {
            processor.close();
            return None;
        }
        Some(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    /// Hands out canned reads one chunk at a time
    struct Script {
        reads: Mutex<Vec<Vec<u8>>>,
    }

    impl Script {
        fn new(reads: &[&[u8]]) -> Self {
            let mut reads: Vec<Vec<u8>> = reads.iter().map(|r| r.to_vec()).collect();
            reads.reverse();
            Self {
                reads: Mutex::new(reads),
            }
        }
    }

    impl Messenger for Script {
        fn send(&self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.reads.lock().unwrap().pop() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_service_kind() {
        assert_eq!(
            ServiceKind::from_name("pipe:opengles"),
            ServiceKind::OpenGles
        );
        assert_eq!(
            ServiceKind::from_name("pipe:qemud:boot-properties"),
            ServiceKind::BootProperties
        );
        assert_eq!(
            ServiceKind::from_name("pipe:anbox:control"),
            ServiceKind::Control
        );
        assert_eq!(
            ServiceKind::from_name("pipe:qemud:sensors"),
            ServiceKind::Unsupported("pipe:qemud:sensors".to_string())
        );
    }

    #[test]
    fn test_name_split_across_reads() {
        let script = Script::new(&[&b"pipe:qemud:"[..], &b"boot-properties\x000004li"[..]]);
        let (name, rest) = read_service_name(&script).unwrap();
        assert_eq!(name, "pipe:qemud:boot-properties");
        assert_eq!(rest, b"0004li");
    }

    #[test]
    fn test_close_before_name() {
        let script = Script::new(&[&b"pipe:open"[..]]);
        assert_eq!(read_service_name(&script), None);
    }

    #[test]
    fn test_name_too_long() {
        let long = vec![b'a'; MAX_SERVICE_NAME_LEN + 1];
        let script = Script::new(&[&long[..], &b"\0"[..]]);
        assert_eq!(read_service_name(&script), None);
    }

    #[test]
    fn test_longest_name_accepted() {
        let mut name = vec![b'a'; MAX_SERVICE_NAME_LEN];
        name.push(0);
        let script = Script::new(&[&name[..]]);
        let (name, rest) = read_service_name(&script).unwrap();
        assert_eq!(name.len(), MAX_SERVICE_NAME_LEN);
        assert!(rest.is_empty());
    }
}
