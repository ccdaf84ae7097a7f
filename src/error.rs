// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the download queue.
//!
//! - [`QueueError`]: synchronous admission and control failures, returned to
//!   the caller and never stored on a job.
//! - [`FetchError`]: transport failures, recorded on the job as a string.
//! - [`ReadError`]: sticky failures of the body stream wrappers, carried
//!   inside `std::io::Error` so any `AsyncRead` consumer can propagate them.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::download::types::CANCELLED_SENTINEL;

/// Admission and control errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full: all {capacity} slots hold active or paused jobs")]
    QueueFull { capacity: usize },

    #[error("URL required")]
    UrlRequired,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} already finished")]
    AlreadyFinished(String),

    #[error("job {0} cannot be paused in its current state")]
    NotPausable(String),

    #[error("job {0} is not paused")]
    NotPaused(String),

    #[error("job {0} is not retryable")]
    NotRetryable(String),

    #[error("download queue is shutting down")]
    ShuttingDown,
}

/// Transport failures while fetching a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    Request(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded {code} {reason}")]
    Status { code: u16, reason: String },

    #[error("reading response body failed: {0}")]
    Body(String),

    #[error("{}", CANCELLED_SENTINEL)]
    Cancelled,
}

impl FetchError {
    /// Classify a reqwest failure that happened before the body was streamed.
    ///
    /// Connect-phase timeouts name the `connect` budget, later ones the
    /// `overall` budget.
    pub fn from_reqwest(err: reqwest::Error, connect: Duration, overall: Duration) -> Self {
        let phase = if err.is_connect() {
            Phase::Connect
        } else if err.is_builder() {
            Phase::Build
        } else {
            Phase::Transfer
        };
        Self::classify(phase, err.is_timeout(), error_chain(&err), connect, overall)
    }

    fn classify(phase: Phase, timed_out: bool, detail: String, connect: Duration, overall: Duration) -> Self {
        match (phase, timed_out) {
            (Phase::Connect, true) => FetchError::Timeout(connect),
            (Phase::Connect, false) => FetchError::Connect(detail),
            (Phase::Build, _) => FetchError::Request(detail),
            (Phase::Transfer, true) => FetchError::Timeout(overall),
            (Phase::Transfer, false) => FetchError::Body(detail),
        }
    }
}

/// Where a request failure happened.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Build,
    Connect,
    Transfer,
}

/// Sticky failures armed by the body stream wrappers.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("idle timeout: no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("{}", CANCELLED_SENTINEL)]
    Cancelled,

    #[error("reader closed")]
    Closed,
}

impl ReadError {
    /// The `io::ErrorKind` this failure surfaces as.
    pub fn kind(self) -> io::ErrorKind {
        match self {
            ReadError::IdleTimeout(_) => io::ErrorKind::TimedOut,
            ReadError::Cancelled => io::ErrorKind::Interrupted,
            ReadError::Closed => io::ErrorKind::BrokenPipe,
        }
    }

    /// Recover a `ReadError` from an `io::Error` produced by [`From`].
    pub fn from_io(err: &io::Error) -> Option<ReadError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<ReadError>())
            .copied()
    }
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

/// Render an error with its whole source chain, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
