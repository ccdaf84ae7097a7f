// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download worker: runs one job from slot acquisition to a terminal state.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::io::StreamReader;

use super::idle::IdleTimeoutReader;
use super::ingest::{BodyReader, ResourceIngestor};
use super::job::{Job, JobStateError, RunTicket};
use super::progress::ProgressReader;
use crate::config::QueueConfig;
use crate::error::{error_chain, FetchError};

/// Shared by every worker of one manager.
pub struct WorkerContext {
    pub semaphore: Arc<Semaphore>,
    pub client: reqwest::Client,
    pub ingestor: Arc<dyn ResourceIngestor>,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub header_timeout: Duration,
    pub overall_timeout: Duration,
    pub progress_interval: Duration,
}

impl WorkerContext {
    pub fn new(config: &QueueConfig, ingestor: Arc<dyn ResourceIngestor>) -> Result<Self, FetchError> {
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.workers())),
            client: build_client(config)?,
            ingestor,
            idle_timeout: config.idle_timeout(),
            connect_timeout: connect_budget(config),
            header_timeout: config.response_header_timeout(),
            overall_timeout: config.overall_timeout(),
            progress_interval: config.progress_interval(),
        })
    }
}

/// reqwest folds the TLS handshake into its connect timeout, so the
/// connection budget is the dial timeout plus the handshake's half of it.
fn connect_budget(config: &QueueConfig) -> Duration {
    config.connect_timeout() + config.tls_handshake_timeout()
}

/// HTTP client with the queue's connect and overall budgets.
pub fn build_client(config: &QueueConfig) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .connect_timeout(connect_budget(config))
        .timeout(config.overall_timeout())
        .user_agent(concat!("fetchq/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Request(error_chain(&e)))
}

/// How a run ended, before it is written to the job.
enum Outcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Drive one run of `job`. Never panics on I/O failures; every exit path
/// leaves the job in a terminal state, or untouched if the run was
/// superseded or paused.
pub async fn run(ctx: Arc<WorkerContext>, job: Arc<Job>, ticket: RunTicket) {
    let RunTicket { generation, token } = ticket;

    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            settle(&job, generation, Outcome::Cancelled);
            return;
        }
        permit = Arc::clone(&ctx.semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            // Closed on shutdown.
            Err(_) => {
                settle(&job, generation, Outcome::Cancelled);
                return;
            }
        },
    };

    if let Err(e) = job.start(generation) {
        tracing::debug!(job_id = %job.id(), error = %e, "Run no longer current, skipping");
        return;
    }
    tracing::info!(job_id = %job.id(), url = %job.url(), "Download started");

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Cancelled,
        outcome = fetch_and_ingest(&ctx, &job, generation, &token) => outcome,
    };

    let outcome = match outcome {
        Outcome::Failed(_) if token.is_cancelled() => Outcome::Cancelled,
        other => other,
    };
    settle(&job, generation, outcome);
}

async fn fetch_and_ingest(ctx: &WorkerContext, job: &Arc<Job>, generation: u64, token: &CancellationToken) -> Outcome {
    let response = match tokio::time::timeout(ctx.header_timeout, ctx.client.get(job.url()).send()).await {
        Err(_) => return Outcome::Failed(FetchError::Timeout(ctx.header_timeout).to_string()),
        Ok(Err(e)) => {
            let err = FetchError::from_reqwest(e, ctx.connect_timeout, ctx.overall_timeout);
            return Outcome::Failed(err.to_string());
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let err = FetchError::Status {
            code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        };
        return Outcome::Failed(err.to_string());
    }

    let total = response
        .content_length()
        .and_then(|n| i64::try_from(n).ok())
        .unwrap_or(-1);
    if job.set_total(generation, total).is_err() {
        return Outcome::Cancelled;
    }

    let overall = ctx.overall_timeout;
    let body = response.bytes_stream().map_err(move |e| {
        let err = if e.is_timeout() {
            FetchError::Timeout(overall)
        } else {
            FetchError::Body(error_chain(&e))
        };
        io::Error::new(io::ErrorKind::Other, err)
    });
    let reader = wrap_body(ctx, job, generation, token.clone(), StreamReader::new(Box::pin(body)));

    let filename = filename_for(job.url(), &job.params().file_name);
    let result = ctx.ingestor.ingest(reader, &filename, job.params()).await;

    match result {
        Ok(handle) => Outcome::Completed(handle.id),
        Err(e) => Outcome::Failed(format!("{e:#}")),
    }
}

/// Idle timeout first, then byte counting. Progress events are throttled to
/// one per `progress_interval`; end-of-stream flips the job to `processing`.
fn wrap_body<R>(ctx: &WorkerContext, job: &Arc<Job>, generation: u64, token: CancellationToken, body: R) -> BodyReader
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let idle = IdleTimeoutReader::new(body, ctx.idle_timeout, token);

    let interval = ctx.progress_interval;
    let mut last_emit = Instant::now();
    let progress_job = Arc::clone(job);
    let complete_job = Arc::clone(job);

    let reader = ProgressReader::new(idle, move |downloaded| {
        let publish = last_emit.elapsed() >= interval;
        if publish {
            last_emit = Instant::now();
        }
        let _ = progress_job.record_progress(generation, downloaded, publish);
    })
    .on_complete(move |downloaded| {
        if let Err(e) = complete_job.finish_download(generation, downloaded) {
            tracing::debug!(job_id = %complete_job.id(), error = %e, "End of stream after state change");
        }
    });
    Box::pin(reader)
}

/// Write the outcome to the job. Rejections mean someone else (pause, a
/// newer run) owns the job now, so they are only logged.
fn settle(job: &Job, generation: u64, outcome: Outcome) {
    let result: Result<(), JobStateError> = match outcome {
        Outcome::Completed(resource_id) => {
            // The ingestor may finish without draining the stream to EOF.
            if job.status() == super::types::JobStatus::Downloading {
                let downloaded = job.snapshot().progress;
                let _ = job.finish_download(generation, downloaded);
            }
            job.complete(generation, resource_id.as_str()).map(|view| {
                tracing::info!(
                    job_id = %view.id,
                    resource_id = %resource_id,
                    downloaded = view.progress,
                    total = view.total_size,
                    "Download completed"
                );
            })
        }
        Outcome::Failed(message) => job.fail(generation, message.as_str()).map(|view| {
            tracing::warn!(job_id = %view.id, url = %view.url, error = %view.error, "Download failed");
        }),
        Outcome::Cancelled => job.observe_cancellation(generation).map(|cancelled| {
            if cancelled {
                tracing::info!(job_id = %job.id(), "Download cancelled");
            }
        }),
    };

    if let Err(e) = result {
        tracing::debug!(job_id = %job.id(), error = %e, "Outcome not recorded");
    }
}

/// Caller-supplied name, else the last path segment of the URL.
pub fn filename_for(url: &str, supplied: &str) -> String {
    let supplied = supplied.trim();
    if !supplied.is_empty() {
        return supplied.to_string();
    }
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download".to_string())
}
