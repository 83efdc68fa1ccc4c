// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Host assembly
//!
//! Builds the renderer, the presentation window, the compositor and the
//! published qemu pipe once at startup and hands them to the services
//! explicitly.

use std::io;
use std::path::Path;
use std::sync::Arc;

use ananbox_render::{LayerComposer, NativeWindow, Rect, Renderer, RendererError, SoftwareDriver};
use log::info;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::boot_properties::BootProperties;
use crate::compositor::Compositor;
use crate::config::{ConfigError, HostConfig};
use crate::connector::{
    ConnectionRegistry, ConnectorError, ConnectorOptions, PublishedSocketConnector,
};
use crate::pipe_connection_creator::{PipeConnectionCreator, Services};
use crate::protocol::DEFAULT_BUFFER_COUNT;
use crate::shm::{HeadlessWindow, ShmWindow};

#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("renderer: {0}")]
    Renderer(#[from] RendererError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("presentation window: {0}")]
    Presentation(#[source] io::Error),
}

/// A running host
pub struct Host {
    renderer: Arc<Renderer>,
    compositor: Arc<Compositor>,
    connector: Option<PublishedSocketConnector>,
    refresh_tx: Option<oneshot::Sender<()>>,
    refresh_task: Option<JoinHandle<()>>,
}

impl Host {
    /// Bring everything up and start serving; must run inside a tokio runtime
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        let display = config.display_info();
        let renderer = Arc::new(Renderer::new(Arc::new(SoftwareDriver::new()), display)?);

        let window: Arc<dyn NativeWindow> = match &config.shm_path {
            Some(path) => Arc::new(
                ShmWindow::create(path, display.width, display.height, DEFAULT_BUFFER_COUNT)
                    .map_err(HostError::Presentation)?,
            ),
            None => Arc::new(HeadlessWindow::new(display.width, display.height)),
        };
        let composer = LayerComposer::new(
            Arc::clone(&renderer),
            Rect::full(display.width, display.height),
            window,
        );
        let compositor = Arc::new(Compositor::new(composer));

        let boot_properties = BootProperties::from_config(&config);
        info!("boot properties: {:?}", boot_properties.entries());

        let registry = Arc::new(ConnectionRegistry::default());
        let creator = Arc::new(PipeConnectionCreator::new(Services {
            renderer: Arc::clone(&renderer),
            compositor: Arc::clone(&compositor),
            boot_properties,
            connections: Arc::clone(&registry),
        }));
        let connector = PublishedSocketConnector::listen(
            &config.socket_path,
            creator,
            registry,
            ConnectorOptions {
                max_connections: config.max_connections,
                idle_timeout: config.idle_timeout(),
            },
        )
        .await?;

        let (refresh_tx, refresh_rx) = oneshot::channel();
        let refresh_task = tokio::spawn(
            Arc::clone(&compositor).run(config.frame_interval(), refresh_rx),
        );

        Ok(Self {
            renderer,
            compositor,
            connector: Some(connector),
            refresh_tx: Some(refresh_tx),
            refresh_task: Some(refresh_task),
        })
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn compositor(&self) -> &Arc<Compositor> {
        &self.compositor
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.connector.as_ref().map(PublishedSocketConnector::socket_path)
    }

    pub fn connections(&self) -> usize {
        self.connector
            .as_ref()
            .map_or(0, |connector| connector.registry().live())
    }

    /// Stop accepting, close every connection and stop the refresh loop
    pub async fn shutdown(mut self) {
        if let Some(connector) = self.connector.take() {
            connector.shutdown().await;
        }
        if let Some(tx) = self.refresh_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.refresh_task.take() {
            let _ = task.await;
        }
        let stats = self.renderer.stats();
        info!(
            "host stopped: {} frames composed, {} color buffers left",
            stats.frames, stats.color_buffers
        );
    }
}
