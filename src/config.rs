// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the queue and the HTTP server.
//!
//! Loaded from `~/.fetchq/config.json` when present. Every field has a
//! default, so a partial file (or none at all) is fine. Zero durations and
//! zero counts fall back to the defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_OVERALL_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 60 * 60;
pub const DEFAULT_PAUSED_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;
pub const DEFAULT_PORT: u16 = 8790;

/// Download queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    /// Maximum concurrent worker runs
    pub workers: usize,
    /// Maximum jobs kept in the table
    pub capacity: usize,
    pub completed_retention_secs: u64,
    pub paused_retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-subscriber event buffer
    pub event_buffer: usize,
    /// Minimum gap between progress events of one job
    pub progress_interval_ms: u64,
    /// Sub-second idle timeout; overrides `idle_timeout_secs` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            overall_timeout_secs: DEFAULT_OVERALL_TIMEOUT_SECS,
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_CAPACITY,
            completed_retention_secs: DEFAULT_COMPLETED_RETENTION_SECS,
            paused_retention_secs: DEFAULT_PAUSED_RETENTION_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            event_buffer: crate::download::events::DEFAULT_EVENT_BUFFER,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            idle_timeout_ms: None,
        }
    }
}

fn secs_or(value: u64, default: u64) -> Duration {
    Duration::from_secs(if value == 0 { default } else { value })
}

fn count_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

impl QueueConfig {
    pub fn connect_timeout(&self) -> Duration {
        secs_or(self.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS)
    }

    /// TLS handshakes get half of the connect budget.
    pub fn tls_handshake_timeout(&self) -> Duration {
        self.connect_timeout() / 2
    }

    /// Budget for the response headers once the request is sent.
    pub fn response_header_timeout(&self) -> Duration {
        self.connect_timeout()
    }

    pub fn idle_timeout(&self) -> Duration {
        match self.idle_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => secs_or(self.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn overall_timeout(&self) -> Duration {
        secs_or(self.overall_timeout_secs, DEFAULT_OVERALL_TIMEOUT_SECS)
    }

    pub fn workers(&self) -> usize {
        count_or(self.workers, DEFAULT_WORKERS)
    }

    pub fn capacity(&self) -> usize {
        count_or(self.capacity, DEFAULT_CAPACITY)
    }

    pub fn completed_retention(&self) -> Duration {
        secs_or(self.completed_retention_secs, DEFAULT_COMPLETED_RETENTION_SECS)
    }

    pub fn paused_retention(&self) -> Duration {
        secs_or(self.paused_retention_secs, DEFAULT_PAUSED_RETENTION_SECS)
    }

    pub fn sweep_interval(&self) -> Duration {
        secs_or(self.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS)
    }

    pub fn event_buffer(&self) -> usize {
        count_or(self.event_buffer, crate::download::events::DEFAULT_EVENT_BUFFER)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(if self.progress_interval_ms == 0 {
            DEFAULT_PROGRESS_INTERVAL_MS
        } else {
            self.progress_interval_ms
        })
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to (defaults to 127.0.0.1, localhost only).
    pub bind_address: String,
    pub port: u16,
    /// Where the directory ingestor stores downloads.
    pub storage_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            storage_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("store"))
    }
}

/// Everything in `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
}

/// `~/.fetchq`, or `.fetchq` in the working directory without a home.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".fetchq"))
        .unwrap_or_else(|| PathBuf::from(".fetchq"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load the config file, or defaults if it does not exist.
pub fn load_config() -> Result<AppConfig> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &std::path::Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse config file {:?}", path))
}
