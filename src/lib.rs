// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fetchq - background download queue
//!
//! Submit URLs, fetch them on a bounded worker pool, stream the bodies into a
//! pluggable ingestor, and watch every state change over server-sent events.
//!
//! # Core Modules
//!
//! - [`download`] - Job lifecycle, workers, admission and retention
//! - [`server`] - HTTP surface and SSE stream
//! - [`config`] - Queue and server settings
//! - [`error`] - Queue, transport and stream errors
//! - [`errors`] - User-facing API errors with reference codes

pub mod config;
pub mod download;
pub mod error;
pub mod errors;
pub mod server;
pub mod sync;

pub use config::{load_config, AppConfig, QueueConfig, ServerConfig};
pub use download::{
    DirectoryIngestor, DownloadManager, JobEvent, JobParams, JobStatus, JobView, ResourceHandle,
    ResourceIngestor,
};
pub use error::{FetchError, QueueError, ReadError};
pub use errors::{generate_reference_code, ApiError};
pub use server::Server;
