// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for ananbox-host
//!
//! Every test talks to a real Unix socket inside a temporary directory:
//! - qemud boot properties
//! - render control against the software renderer
//! - control channel
//! - connector admission and shutdown

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ananbox_host::protocol::{PresentFlags, RENDER_HEADER_LEN};
use ananbox_host::{
    ConnectionCreator, ConnectionRegistry, ConnectorOptions, ControlResponse, Host, HostConfig,
    MessageProcessor, Messenger, PublishedSocketConnector, ShmWindow,
};
use ananbox_render::gles::format::{GL_RGBA, GL_UNSIGNED_BYTE};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const DISPLAY: u32 = 16;

fn config(dir: &Path) -> HostConfig {
    HostConfig {
        socket_path: dir.join("qemu_pipe"),
        width: DISPLAY,
        height: DISPLAY,
        dpi: 240,
        refresh_rate: 200,
        api_level: 30,
        use_memfd: Some(true),
        shm_path: Some(dir.join("present")),
        ..Default::default()
    }
}

async fn open_pipe(path: &Path, service: &str) -> UnixStream {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream.write_all(service.as_bytes()).await.unwrap();
    stream.write_all(b"\0").await.unwrap();
    stream
}

async fn read_qemud_frame(stream: &mut UnixStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = usize::from_str_radix(std::str::from_utf8(&header).unwrap(), 16).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn packet(opcode: u32, args: &[u32], payload: &[u8]) -> Vec<u8> {
    let size = RENDER_HEADER_LEN + args.len() * 4 + payload.len();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(&(size as u32).to_le_bytes());
    for arg in args {
        out.extend_from_slice(&arg.to_le_bytes());
    }
    out.extend_from_slice(payload);
    out
}

async fn read_u32(stream: &mut UnixStream) -> u32 {
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    u32::from_le_bytes(reply)
}

// ============================================================================
// Boot Properties Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_boot_properties_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let mut stream = open_pipe(&socket, "pipe:qemud:boot-properties").await;
    stream.write_all(b"0004list").await.unwrap();

    let mut frames = Vec::new();
    loop {
        let frame = read_qemud_frame(&mut stream).await;
        if frame == b"\0" {
            break;
        }
        frames.push(String::from_utf8(frame).unwrap());
    }
    assert_eq!(
        frames,
        [
            "ro.sf.lcd_density=240",
            "ro.ananbox.host.api_level=30",
            "sys.use_memfd=1",
        ]
    );
    for frame in &frames {
        let (key, value) = frame.split_once('=').unwrap();
        assert!(!key.is_empty());
        assert!(value.parse::<u32>().is_ok_and(|v| v <= 240), "{frame}");
    }

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_boot_properties_ignore_unknown_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let mut stream = open_pipe(&socket, "pipe:qemud:boot-properties").await;
    stream.write_all(b"0005hello").await.unwrap();

    let mut buf = [0u8; 16];
    // no reply within the window
    tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf))
        .await
        .unwrap_err();

    // the connection is still served
    stream.write_all(b"0004list").await.unwrap();
    assert_eq!(
        read_qemud_frame(&mut stream).await,
        b"ro.sf.lcd_density=240"
    );

    host.shutdown().await;
}

// ============================================================================
// Graphics Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_render_control_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let mut stream = open_pipe(&socket, "pipe:opengles").await;

    stream
        .write_all(&packet(10007, &[1], &[]))
        .await
        .unwrap();
    assert_eq!(read_u32(&mut stream).await, DISPLAY);

    stream
        .write_all(&packet(10012, &[4, 4, GL_RGBA], &[]))
        .await
        .unwrap();
    let handle = read_u32(&mut stream).await;
    assert_ne!(handle, 0);
    assert_eq!(host.renderer().stats().color_buffers, 1);

    let red: Vec<u8> = [0xff, 0, 0, 0xff].repeat(4);
    stream
        .write_all(&packet(
            10024,
            &[handle, 0, 0, 2, 2, GL_RGBA, GL_UNSIGNED_BYTE, 16],
            &red,
        ))
        .await
        .unwrap();
    assert_eq!(read_u32(&mut stream).await, 0);

    stream
        .write_all(&packet(
            10023,
            &[handle, 0, 0, 2, 2, GL_RGBA, GL_UNSIGNED_BYTE, 16],
            &[],
        ))
        .await
        .unwrap();
    let mut pixels = [0u8; 16];
    stream.read_exact(&mut pixels).await.unwrap();
    assert_eq!(pixels.to_vec(), red);

    // unsupported formats are refused with a zero handle
    stream
        .write_all(&packet(10012, &[4, 4, 0x1234], &[]))
        .await
        .unwrap();
    assert_eq!(read_u32(&mut stream).await, 0);

    // so are sizes beyond the texture limit, without allocating
    stream
        .write_all(&packet(10012, &[u32::MAX, u32::MAX, GL_RGBA], &[]))
        .await
        .unwrap();
    assert_eq!(read_u32(&mut stream).await, 0);
    assert_eq!(host.renderer().stats().color_buffers, 1);

    // the connection's buffers go away with it
    drop(stream);
    let renderer = Arc::clone(host.renderer());
    assert!(wait_for(|| renderer.stats().color_buffers == 0).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_buffer_survives_creator_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let mut creator = open_pipe(&socket, "pipe:opengles").await;
    creator
        .write_all(&packet(10012, &[4, 4, GL_RGBA], &[]))
        .await
        .unwrap();
    let handle = read_u32(&mut creator).await;

    let mut user = open_pipe(&socket, "pipe:opengles").await;
    user.write_all(&packet(10013, &[handle], &[]))
        .await
        .unwrap();
    // a reply-bearing command orders the open before the disconnect below
    user.write_all(&packet(10000, &[], &[])).await.unwrap();
    assert_eq!(read_u32(&mut user).await, 1);

    drop(creator);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.renderer().stats().color_buffers, 1);

    drop(user);
    let renderer = Arc::clone(host.renderer());
    assert!(wait_for(|| renderer.stats().color_buffers == 0).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fb_post_reaches_presentation() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let present = dir.path().join("present");
    let host = Host::start(config).await.unwrap();

    let mut stream = open_pipe(&socket, "pipe:opengles").await;
    stream
        .write_all(&packet(10012, &[DISPLAY, DISPLAY, GL_RGBA], &[]))
        .await
        .unwrap();
    let handle = read_u32(&mut stream).await;

    let green: Vec<u8> = [0, 0xff, 0, 0xff].repeat((DISPLAY * DISPLAY) as usize);
    let mut args = vec![handle, 0, 0, DISPLAY, DISPLAY, GL_RGBA, GL_UNSIGNED_BYTE];
    args.push(green.len() as u32);
    stream
        .write_all(&packet(10024, &args, &green))
        .await
        .unwrap();
    assert_eq!(read_u32(&mut stream).await, 0);

    stream
        .write_all(&packet(10018, &[handle], &[]))
        .await
        .unwrap();
    let renderer = Arc::clone(host.renderer());
    assert!(wait_for(|| renderer.stats().frames >= 1).await);

    let viewer = ShmWindow::open(&present).unwrap();
    assert!(viewer.flags().contains(PresentFlags::FRAME_VALID));
    let frame = viewer.latest_frame().unwrap();
    assert_eq!((frame.width, frame.height), (DISPLAY, DISPLAY));
    assert!(frame.pixels.chunks(4).all(|p| p == [0, 0xff, 0, 0xff]));

    drop(stream);
    host.shutdown().await;
}

// ============================================================================
// Control Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let stream = open_pipe(&socket, "pipe:anbox:control").await;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"type\":\"Ping\"}\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_str::<ControlResponse>(&line).unwrap(),
        ControlResponse::Pong
    );

    write
        .write_all(b"{\"type\":\"GetStatus\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let ControlResponse::Status(status) = serde_json::from_str::<ControlResponse>(&line).unwrap() else {
        panic!("unexpected response {line}");
    };
    assert_eq!(status.connections, 1);
    assert_eq!((status.width, status.height), (DISPLAY, DISPLAY));
    assert_eq!(status.color_buffers, 0);

    write.write_all(b"not json\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert!(matches!(
        serde_json::from_str::<ControlResponse>(&line).unwrap(),
        ControlResponse::Error { .. }
    ));

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_service_is_accepted_and_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();

    let mut stream = open_pipe(&socket, "pipe:qemud:sensors").await;
    stream.write_all(b"0004list").await.unwrap();
    let mut buf = [0u8; 8];
    tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf))
        .await
        .unwrap_err();
    assert!(wait_for(|| host.connections() == 1).await);

    host.shutdown().await;
}

// ============================================================================
// Connector Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_connections_and_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let socket = config.socket_path.clone();
    let host = Host::start(config).await.unwrap();
    assert!(socket.exists());

    let mut stream = open_pipe(&socket, "pipe:anbox:control").await;
    assert!(wait_for(|| host.connections() == 1).await);

    host.shutdown().await;
    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(!socket.exists());
}

struct Echo {
    messenger: Arc<dyn Messenger>,
}

impl MessageProcessor for Echo {
    fn process_data(&mut self, data: &[u8]) -> bool {
        self.messenger.send(data).is_ok()
    }
}

struct EchoCreator;

impl ConnectionCreator for EchoCreator {
    fn create_processor(&self, messenger: Arc<dyn Messenger>) -> Option<Box<dyn MessageProcessor>> {
        Some(Box::new(Echo { messenger }))
    }
}

async fn echo_connector(path: PathBuf, max_connections: usize) -> PublishedSocketConnector {
    PublishedSocketConnector::listen(
        path,
        Arc::new(EchoCreator),
        Arc::new(ConnectionRegistry::default()),
        ConnectorOptions {
            max_connections,
            idle_timeout: None,
        },
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admission_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo");
    let connector = echo_connector(path.clone(), 1).await;

    let mut first = UnixStream::connect(&path).await.unwrap();
    first.write_all(b"a").await.unwrap();
    let mut buf = [0u8; 1];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"a");

    let mut second = UnixStream::connect(&path).await.unwrap();
    second.write_all(b"b").await.unwrap();
    // still waiting for a permit
    tokio::time::timeout(Duration::from_millis(200), second.read(&mut buf))
        .await
        .unwrap_err();

    drop(first);
    tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"b");

    connector.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_connections_are_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo");
    let connector = PublishedSocketConnector::listen(
        &path,
        Arc::new(EchoCreator),
        Arc::new(ConnectionRegistry::default()),
        ConnectorOptions {
            max_connections: 4,
            idle_timeout: Some(Duration::from_millis(50)),
        },
    )
    .await
    .unwrap();

    let mut stream = UnixStream::connect(&path).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    let registry = Arc::clone(connector.registry());
    assert!(wait_for(|| registry.live() == 0).await);
    assert_eq!(registry.accepted(), 1);

    connector.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo");
    let first = echo_connector(path.clone(), 2).await;
    // forget the first connector without cleanup so its socket file stays
    std::mem::forget(first);
    assert!(path.exists());

    let second = echo_connector(path.clone(), 2).await;
    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(b"z").await.unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"z");

    second.shutdown().await;
}
