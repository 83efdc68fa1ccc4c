// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Host configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ananbox_render::gles::MAX_TEXTURE_SIZE;
use ananbox_render::DisplayInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Host configuration, loaded from JSON with every field optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Path of the published qemu pipe socket
    pub socket_path: PathBuf,
    /// Display width in pixels
    pub width: u32,
    /// Display height in pixels
    pub height: u32,
    /// Display density reported to the guest
    pub dpi: u32,
    /// Composition refresh rate in Hz
    pub refresh_rate: u32,
    /// Blocking worker threads serving connections
    pub workers: usize,
    /// Concurrent connections admitted
    pub max_connections: usize,
    /// Drop connections idle this long, 0 to wait forever
    pub idle_timeout_secs: u64,
    /// Host API level reported to the guest
    pub api_level: u32,
    /// memfd support reported to the guest; probed when unset
    pub use_memfd: Option<bool>,
    /// Shared-memory presentation file; headless when unset
    pub shm_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("./qemu_pipe"),
            width: 1024,
            height: 768,
            dpi: 160,
            refresh_rate: 60,
            workers: 4,
            max_connections: 64,
            idle_timeout_secs: 0,
            api_level: 30,
            use_memfd: None,
            shm_path: None,
        }
    }
}

impl HostConfig {
    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid("display dimensions must be non-zero"));
        }
        if self.width > MAX_TEXTURE_SIZE || self.height > MAX_TEXTURE_SIZE {
            return Err(ConfigError::Invalid("display dimensions exceed 4096"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required"));
        }
        if self.refresh_rate == 0 {
            return Err(ConfigError::Invalid("refresh rate must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        Ok(())
    }

    pub fn display_info(&self) -> DisplayInfo {
        DisplayInfo {
            width: self.width,
            height: self.height,
            xdpi: self.dpi,
            ydpi: self.dpi,
            refresh_rate: self.refresh_rate,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs != 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate.max(1)
    }

    /// Configured memfd flag, or whether this host supports memfd
    pub fn memfd_enabled(&self) -> bool {
        self.use_memfd.unwrap_or_else(probe_memfd)
    }
}

#[cfg(target_os = "linux")]
fn probe_memfd() -> bool {
    let name = c"ananbox-probe";
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return false;
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned here.
    unsafe { libc::close(fd) };
    true
}

#[cfg(not(target_os = "linux"))]
fn probe_memfd() -> bool {
    false
}
