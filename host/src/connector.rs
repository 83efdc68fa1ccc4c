// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Published socket connector
//!
//! Accepts connections on a Unix socket path and serves each one on the
//! blocking worker pool: the connection creator picks a processor, then a
//! read loop feeds it until the peer goes away or the connector shuts
//! down.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::message_processor::MessageProcessor;
use crate::messenger::{Messenger, SocketMessenger};

/// Read size of the per-connection loop
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long shutdown waits for connection loops to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("failed to bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Chooses the processor serving a new connection
pub trait ConnectionCreator: Send + Sync {
    /// Build the processor for `messenger`
    ///
    /// May block reading from the messenger; `None` drops the connection.
    fn create_processor(&self, messenger: Arc<dyn Messenger>) -> Option<Box<dyn MessageProcessor>>;
}

/// Live connections, closable as a group
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    accepted: AtomicU64,
    live: Mutex<HashMap<u64, Arc<dyn Messenger>>>,
}

impl ConnectionRegistry {
    fn live_map(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn Messenger>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, messenger: Arc<dyn Messenger>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.live_map().insert(id, messenger);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.live_map().remove(&id);
    }

    pub fn live(&self) -> usize {
        self.live_map().len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Close every live transport, unblocking their read loops
    pub fn close_all(&self) {
        let messengers: Vec<_> = self.live_map().values().cloned().collect();
        for messenger in messengers {
            messenger.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Connections served at once; further peers wait in the backlog
    pub max_connections: usize,
    /// Close connections idle this long
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            max_connections: 64,
            idle_timeout: None,
        }
    }
}

/// Drive one connection to completion
pub fn serve_connection(creator: &dyn ConnectionCreator, messenger: &Arc<dyn Messenger>) {
    let Some(mut processor) = creator.create_processor(Arc::clone(messenger)) else {
        messenger.close();
        return;
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match messenger.receive(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !processor.process_data(&buf[..n]) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                debug!("closing idle connection");
                break;
            }
            Err(e) => {
                debug!("connection read failed: {e}");
                break;
            }
        }
    }

    processor.close();
    messenger.close();
}

fn remove_stale_socket(path: &Path) -> Result<(), ConnectorError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(ConnectorError::NotASocket(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Connector bound to a socket path
///
/// Dropping it stops accepting and closes every live connection.
pub struct PublishedSocketConnector {
    path: PathBuf,
    registry: Arc<ConnectionRegistry>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PublishedSocketConnector {
    /// Bind `path` and start accepting; must run inside a tokio runtime
    pub async fn listen<P: AsRef<Path>>(
        path: P,
        creator: Arc<dyn ConnectionCreator>,
        registry: Arc<ConnectionRegistry>,
        options: ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        let path = path.as_ref().to_path_buf();
        remove_stale_socket(&path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path).map_err(|source| ConnectorError::Bind {
            path: path.clone(),
            source,
        })?;
        info!("listening on {}", path.display());

        let max_connections = options.max_connections.max(1);
        let permits = Arc::new(Semaphore::new(max_connections));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            creator,
            Arc::clone(&registry),
            Arc::clone(&permits),
            options.idle_timeout,
            shutdown_rx,
        ));

        Ok(Self {
            path,
            registry,
            permits,
            max_connections,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn stop_accepting(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    fn remove_socket(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", self.path.display());
            }
        }
    }

    /// Stop accepting, close every connection and wait for their loops
    pub async fn shutdown(mut self) {
        self.stop_accepting();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.registry.close_all();

        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.permits.acquire_many(all)).await {
            Ok(_) => debug!("all connections finished"),
            Err(_) => warn!(
                "{} connections still running after shutdown",
                self.registry.live()
            ),
        }
        self.remove_socket();
        info!("connector on {} stopped", self.path.display());
    }
}

impl Drop for PublishedSocketConnector {
    fn drop(&mut self) {
        if self.task.is_none() {
            return;
        }
        self.stop_accepting();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.registry.close_all();
        self.remove_socket();
    }
}

async fn accept_loop(
    listener: UnixListener,
    creator: Arc<dyn ConnectionCreator>,
    registry: Arc<ConnectionRegistry>,
    permits: Arc<Semaphore>,
    idle_timeout: Option<Duration>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let stream = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            },
        };

        let messenger: Arc<dyn Messenger> = match stream
            .into_std()
            .and_then(|stream| SocketMessenger::new(stream, idle_timeout))
        {
            Ok(messenger) => Arc::new(messenger),
            Err(e) => {
                warn!("failed to set up connection: {e}");
                continue;
            }
        };
        let id = registry.register(Arc::clone(&messenger));
        debug!("connection {id} accepted");

        let creator = Arc::clone(&creator);
        let registry = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || {
            serve_connection(&*creator, &messenger);
            registry.unregister(id);
            debug!("connection {id} closed");
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Closed;

    impl ConnectionCreator for Closed {
        fn create_processor(
            &self,
            _messenger: Arc<dyn Messenger>,
        ) -> Option<Box<dyn MessageProcessor>> {
            None
        }
    }

    #[test]
    fn test_registry_counts() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let registry = ConnectionRegistry::default();
        let messenger: Arc<dyn Messenger> = Arc::new(SocketMessenger::new(a, None).unwrap());
        let id = registry.register(Arc::clone(&messenger));
        assert_eq!(registry.live(), 1);
        registry.close_all();
        assert!(messenger.is_closed());
        registry.unregister(id);
        assert_eq!(registry.live(), 0);
        assert_eq!(registry.accepted(), 1);
    }

    #[test]
    fn test_rejected_connection_is_closed() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let messenger: Arc<dyn Messenger> = Arc::new(SocketMessenger::new(a, None).unwrap());
        serve_connection(&Closed, &messenger);
        assert!(messenger.is_closed());
    }

    #[test]
    fn test_refuses_to_replace_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu_pipe");
        fs::write(&path, b"not a socket").unwrap();
        assert!(matches!(
            remove_stale_socket(&path),
            Err(ConnectorError::NotASocket(_))
        ));
        assert!(path.exists());
    }
}
