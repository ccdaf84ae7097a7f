// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! Small HTTP surface over a [`DownloadManager`].
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /download/submit` - Queue newline-separated URLs (form or JSON)
//! - `GET /download/queue` - List all jobs
//! - `POST /download/cancel|pause|resume|retry?id=...` - Job control
//! - `GET /download/events` - Server-sent event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchq::config::QueueConfig;
//! use fetchq::download::{DirectoryIngestor, DownloadManager};
//! use fetchq::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(QueueConfig::default(), Arc::new(DirectoryIngestor::new("store")))?;
//! Server::new(manager).with_port(8790).start().await?;
//! # Ok(())
//! # }
//! ```

pub mod sse;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Query, Request, State},
    http::{header, StatusCode},
    response::Json,
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::DEFAULT_PORT;
use crate::download::{DownloadManager, JobParams, JobView};
use crate::errors::ApiError;

// Maximum request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Server state shared across handlers.
pub struct AppState {
    pub manager: DownloadManager,
}

/// API server configuration.
pub struct Server {
    manager: DownloadManager,
    /// Port to listen on.
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
}

impl Server {
    /// Create a server for `manager`.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(manager: DownloadManager) -> Self {
        Self {
            manager,
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState {
            manager: self.manager.clone(),
        });

        Router::new()
            .route("/health", get(health_handler))
            .route("/download/submit", post(submit_handler))
            .route("/download/queue", get(queue_handler))
            .route("/download/cancel", post(cancel_handler))
            .route("/download/pause", post(pause_handler))
            .route("/download/resume", post(resume_handler))
            .route("/download/retry", post(retry_handler))
            .route("/download/events", get(sse::events_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the server. On SIGINT/SIGTERM the manager is shut down, which
    /// also ends open event streams, and then the server drains.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        // Security warning if binding to all interfaces
        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the download API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another fetchq server may be running; use a different port with: fetchq serve --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        let manager = self.manager.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                manager.shutdown().await;
            })
            .await?;

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    jobs: usize,
    active: usize,
}

/// JSON submission body. Parameters sit next to `URL` at the top level.
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(rename = "URL", alias = "Url", alias = "url", default)]
    url: String,
    #[serde(flatten)]
    params: JobParams,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    queued: bool,
    jobs: Vec<JobView>,
    /// Set when only part of a batch was admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Everything on the wire that carries a job list.
#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdQuery {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    status: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        jobs: state.manager.list().len(),
        active: state.manager.active_count(),
    })
}

async fn queue_handler(State(state): State<Arc<AppState>>) -> Json<QueueSnapshot> {
    Json(QueueSnapshot {
        jobs: state.manager.list(),
    })
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let (urls, params) = read_submission(request).await?;

    match state.manager.submit_multiple(&urls, &params) {
        Ok(jobs) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                queued: true,
                jobs,
                error: None,
            }),
        )),
        Err(batch) if !batch.admitted.is_empty() => {
            tracing::warn!(
                admitted = batch.admitted.len(),
                error = %batch.error,
                "Batch partially admitted"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    queued: true,
                    jobs: batch.admitted,
                    error: Some(batch.error.to_string()),
                }),
            ))
        }
        Err(batch) => Err(batch.error.into()),
    }
}

/// JSON when the client says so, urlencoded form otherwise.
async fn read_submission(request: Request) -> Result<(String, JobParams), ApiError> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("application/json"));

    if is_json {
        let Json(body) = Json::<SubmitRequest>::from_request(request, &())
            .await
            .map_err(|rejection| ApiError::invalid_request(rejection.body_text(), None))?;
        return Ok((body.url, body.params));
    }

    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|rejection| ApiError::invalid_request(rejection.body_text(), None))?;
    parse_submit_form(pairs)
}

/// Fold form pairs into URLs and parameters. List fields may repeat
/// (`Tags[]=1&Tags[]=2`) or hold a comma-separated list.
fn parse_submit_form(pairs: Vec<(String, String)>) -> Result<(String, JobParams), ApiError> {
    let mut urls = Vec::new();
    let mut params = JobParams::default();

    for (key, value) in pairs {
        let field = key.trim_end_matches("[]");
        match field {
            "URL" | "Url" | "url" => urls.push(value),
            "OwnerId" => {
                let value = value.trim();
                if !value.is_empty() {
                    params.owner_id = Some(parse_id(field, value)?);
                }
            }
            "Tags" => push_ids(&mut params.tags, field, &value)?,
            "Groups" => push_ids(&mut params.groups, field, &value)?,
            "Notes" => push_ids(&mut params.notes, field, &value)?,
            "Meta" => params.meta = value,
            "FileName" => params.file_name = value,
            "Description" => params.description = value,
            "Category" => params.category = value,
            "ContentCategory" => params.content_category = value,
            _ => tracing::debug!(field = %key, "Ignoring unknown submit field"),
        }
    }

    Ok((urls.join("\n"), params))
}

fn push_ids(list: &mut Vec<u64>, field: &str, value: &str) -> Result<(), ApiError> {
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        list.push(parse_id(field, part)?);
    }
    Ok(())
}

fn parse_id(field: &str, value: &str) -> Result<u64, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::invalid_request(format!("{field} must be a numeric id, got {value:?}"), Some(field)))
}

/// `id` from the query string, else from an urlencoded body.
fn job_id(query: IdQuery, form: Option<Form<IdQuery>>) -> Result<String, ApiError> {
    query
        .id
        .or_else(|| form.and_then(|Form(f)| f.id))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::invalid_request("id required", Some("id")))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
    form: Option<Form<IdQuery>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let id = job_id(query, form)?;
    state.manager.cancel(&id)?;
    Ok(Json(ControlResponse {
        status: "cancelled".to_string(),
    }))
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
    form: Option<Form<IdQuery>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let id = job_id(query, form)?;
    let view = state.manager.pause(&id)?;
    Ok(Json(ControlResponse {
        status: view.status.to_string(),
    }))
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
    form: Option<Form<IdQuery>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let id = job_id(query, form)?;
    let view = state.manager.resume(&id)?;
    Ok(Json(ControlResponse {
        status: view.status.to_string(),
    }))
}

async fn retry_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
    form: Option<Form<IdQuery>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let id = job_id(query, form)?;
    let view = state.manager.retry(&id)?;
    Ok(Json(ControlResponse {
        status: view.status.to_string(),
    }))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                tracing::error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
