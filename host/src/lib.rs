// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! ananbox host
//!
//! Host side of the qemu pipe: the Android guest opens connections on a
//! Unix socket, names the service it wants and then talks to it.
//!
//! # Overview
//!
//! - **Graphics**: render-control commands driving the renderer's color
//!   buffers, contexts and surfaces
//! - **Boot properties**: the qemud `list` query answered with host values
//! - **Control**: JSON status and liveness queries
//! - **Presentation**: composed frames published to shared memory
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Android guest                          │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ qemu_pipe (Unix socket)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               PublishedSocketConnector                       │
//! │  - async accept loop, bounded admission                     │
//! │  - one blocking read loop per connection                    │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ "pipe:<service>\0"
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 PipeConnectionCreator                        │
//! │  opengles ─────► GraphicsMessageProcessor                   │
//! │  qemud:boot-properties ─► qemud framing + BootProperties    │
//! │  anbox:control ─► ControlMessageProcessor                   │
//! │  anything else ─► NullMessageProcessor                      │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Renderer (ananbox-render)  ◄── Compositor refresh loop     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ShmWindow (memory-mapped frame slots)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ananbox_host::{Host, HostConfig};
//!
//! let host = Host::start(HostConfig::default()).await?;
//! // ...
//! host.shutdown().await;
//! ```
//!
//! # Modules
//!
//! - [`config`]: host configuration
//! - [`protocol`]: wire constants and layouts
//! - [`messenger`]: per-connection transport
//! - [`message_processor`]: processor trait and qemud framing
//! - [`boot_properties`]: boot-properties service
//! - [`graphics`]: render-control service
//! - [`control`]: JSON control service
//! - [`pipe_connection_creator`]: service selection
//! - [`connector`]: socket listener and connection lifecycle
//! - [`compositor`]: refresh on damage
//! - [`shm`]: presentation windows
//! - [`host`]: startup and shutdown

pub mod boot_properties;
pub mod compositor;
pub mod config;
pub mod connector;
pub mod control;
pub mod graphics;
pub mod host;
pub mod message_processor;
pub mod messenger;
pub mod pipe_connection_creator;
pub mod protocol;
pub mod shm;

pub use boot_properties::{BootProperties, BootPropertiesMessageProcessor};
pub use compositor::Compositor;
pub use config::{ConfigError, HostConfig};
pub use connector::{
    ConnectionCreator, ConnectionRegistry, ConnectorError, ConnectorOptions,
    PublishedSocketConnector,
};
pub use control::{ControlMessageProcessor, ControlRequest, ControlResponse, HostStatus};
pub use graphics::{CommandDecoder, GraphicsMessageProcessor, RenderCommand, RenderControlDecoder};
pub use host::{Host, HostError};
pub use message_processor::{
    MessageProcessor, NullMessageProcessor, QemudHandler, QemudMessageProcessor, QemudReply,
};
pub use messenger::{Messenger, SocketMessenger};
pub use pipe_connection_creator::{PipeConnectionCreator, ServiceKind, Services};
pub use shm::{HeadlessWindow, ShmWindow};
