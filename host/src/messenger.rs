// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Duplex byte channel for one accepted connection

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

/// One connection's transport
///
/// Shared between the connection's read loop, its processor and the
/// connector registry; `close` from any holder unblocks a pending
/// `receive`.
pub trait Messenger: Send + Sync {
    /// Send all of `data`
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Receive into `buf`; `Ok(0)` once the peer has gone
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut the transport down in both directions
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Messenger over a blocking Unix stream
pub struct SocketMessenger {
    stream: UnixStream,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SocketMessenger {
    /// Wrap `stream`, failing reads after `idle_timeout` without data
    pub fn new(stream: UnixStream, idle_timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(idle_timeout)?;
        Ok(Self {
            stream,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

impl Messenger for SocketMessenger {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "messenger closed"));
        }
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (&self.stream).write_all(data)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        (&self.stream).read(buf)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {e}");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_receive() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = SocketMessenger::new(a, None).unwrap();
        let right = SocketMessenger::new(b, None).unwrap();
        left.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = right.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_close_unblocks_receive() {
        let (a, _b) = UnixStream::pair().unwrap();
        let messenger = Arc::new(SocketMessenger::new(a, None).unwrap());
        let reader = {
            let messenger = Arc::clone(&messenger);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                messenger.receive(&mut buf).unwrap_or(0)
            })
        };
        thread::sleep(Duration::from_millis(50));
        messenger.close();
        assert_eq!(reader.join().unwrap(), 0);
        assert!(messenger.is_closed());
        assert_eq!(
            messenger.send(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_idle_timeout() {
        let (a, _b) = UnixStream::pair().unwrap();
        let messenger = SocketMessenger::new(a, Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 4];
        let err = messenger.receive(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }
}
