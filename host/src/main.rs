// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! ananbox host CLI entry point
//!
//! Publishes the qemu pipe socket and serves guest connections until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio::sync::Notify;

use ananbox_host::{Host, HostConfig};

fn cli() -> Command {
    Command::new("ananbox-host")
        .version("0.1.0")
        .author("ananbox Authors")
        .about("Host renderer and qemu pipe services for Android guests")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("qemu pipe socket path [default: ./qemu_pipe]"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32))
                .help("Display width [default: 1024]"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32))
                .help("Display height [default: 768]"),
        )
        .arg(
            Arg::new("dpi")
                .long("dpi")
                .value_name("DPI")
                .value_parser(value_parser!(u32))
                .help("Display density reported to the guest [default: 160]"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .value_parser(value_parser!(u32))
                .help("Composition refresh rate [default: 60]"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Worker threads serving connections [default: 4]"),
        )
        .arg(
            Arg::new("max-connections")
                .long("max-connections")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Connections served at once [default: 64]"),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Close connections idle this long, 0 for never [default: 0]"),
        )
        .arg(
            Arg::new("api-level")
                .long("api-level")
                .value_name("LEVEL")
                .value_parser(value_parser!(u32))
                .help("Host API level reported to the guest [default: 30]"),
        )
        .arg(
            Arg::new("shm-path")
                .long("shm-path")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Publish composed frames to this shared memory file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
}

/// File values, then command line overrides
fn load_config(matches: &ArgMatches) -> Result<HostConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };

    if let Some(path) = matches.get_one::<PathBuf>("socket") {
        config.socket_path.clone_from(path);
    }
    if let Some(path) = matches.get_one::<PathBuf>("shm-path") {
        config.shm_path = Some(path.clone());
    }
    if let Some(&v) = matches.get_one::<u32>("width") {
        config.width = v;
    }
    if let Some(&v) = matches.get_one::<u32>("height") {
        config.height = v;
    }
    if let Some(&v) = matches.get_one::<u32>("dpi") {
        config.dpi = v;
    }
    if let Some(&v) = matches.get_one::<u32>("fps") {
        config.refresh_rate = v;
    }
    if let Some(&v) = matches.get_one::<usize>("workers") {
        config.workers = v;
    }
    if let Some(&v) = matches.get_one::<usize>("max-connections") {
        config.max_connections = v;
    }
    if let Some(&v) = matches.get_one::<u64>("idle-timeout") {
        config.idle_timeout_secs = v;
    }
    if let Some(&v) = matches.get_one::<u32>("api-level") {
        config.api_level = v;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("initializing logger")?;

    let config = load_config(&matches)?;
    info!("Starting ananbox-host with config: {config:?}");

    // the compositor refresh takes one blocking thread besides the workers
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.workers + 1)
        .build()
        .context("building runtime")?;

    runtime.block_on(async {
        let host = Host::start(config).await?;

        // Set up Ctrl+C handler
        let stop = Arc::new(Notify::new());
        let s = Arc::clone(&stop);
        ctrlc::set_handler(move || s.notify_one()).context("installing signal handler")?;

        info!("Host running, press Ctrl+C to stop");
        stop.notified().await;

        info!("Stopping host...");
        host.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let matches = cli().get_matches_from([
            "ananbox-host",
            "--socket",
            "/tmp/pipe",
            "--dpi",
            "240",
            "--workers",
            "2",
        ]);
        let config = load_config(&matches).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/pipe"));
        assert_eq!(config.dpi, 240);
        assert_eq!(config.workers, 2);
        assert_eq!(config.width, 1024);
    }

    #[test]
    fn test_cli_rejects_zero_workers() {
        let matches = cli().get_matches_from(["ananbox-host", "--workers", "0"]);
        assert!(load_config(&matches).is_err_and(|e| e.to_string().contains("worker")));
    }

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }
}
