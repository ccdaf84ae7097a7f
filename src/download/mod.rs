// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Download Queue
//!
//! Accepts URLs, fetches them on a bounded pool of workers, streams each body
//! into a [`ResourceIngestor`], and publishes every state change as an event.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ spawn ┌─────────────────┐  body  ┌──────────────────┐
//! │ DownloadManager │──────▶│ worker::run     │───────▶│ ResourceIngestor │
//! │ (job table)     │       │ (semaphore = W) │        │                  │
//! └────────┬────────┘       └────────┬────────┘        └──────────────────┘
//!          │ added/removed           │ updated
//!          ▼                         ▼
//! ┌─────────────────────────────────────────────┐
//! │ EventBus (bounded queue per subscriber)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The response body reaches the ingestor through two adapters:
//! [`IdleTimeoutReader`] (idle and cancellation errors) wrapped by
//! [`ProgressReader`] (byte counting, end-of-stream notification).
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fetchq::config::QueueConfig;
//! use fetchq::download::{DirectoryIngestor, DownloadManager, JobParams};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ingestor = Arc::new(DirectoryIngestor::new("/tmp/fetchq"));
//! let manager = DownloadManager::new(QueueConfig::default(), ingestor)?;
//!
//! let mut events = manager.subscribe();
//! let job = manager.submit("https://example.com/report.pdf", JobParams::default())?;
//! while let Some(event) = events.recv().await {
//!     if event.job.id == job.id && event.job.status.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod idle;
pub mod ingest;
pub mod job;
pub mod manager;
pub mod progress;
pub mod types;
pub mod worker;

pub use events::{EventBus, Subscription};
pub use idle::{CloseReader, IdleTimeoutReader};
pub use ingest::{BodyReader, DirectoryIngestor, ResourceHandle, ResourceIngestor};
pub use job::{Job, JobStateError, RunTicket};
pub use manager::{BatchError, DownloadManager};
pub use progress::ProgressReader;
pub use types::{EventKind, JobEvent, JobParams, JobStatus, JobView, CANCELLED_SENTINEL};
