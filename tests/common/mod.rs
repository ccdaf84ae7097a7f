// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: a local origin server and a recording ingestor.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::Path,
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use futures_util::stream::{self, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use fetchq::config::QueueConfig;
use fetchq::download::{
    BodyReader, DownloadManager, JobEvent, JobParams, JobView, ResourceHandle, ResourceIngestor, Subscription,
};

/// Origin server on an ephemeral port.
///
/// - `/fixed/:size` sends `size` bytes with a `Content-Length`
/// - `/drip` sends one byte per second
/// - `/stall` sends one byte, then nothing
/// - `/truncated` declares 100 bytes, sends 10, then drops the connection
/// - `/status/:code` answers with `code` and no body
pub struct Origin {
    pub addr: SocketAddr,
}

impl Origin {
    pub async fn start() -> Self {
        let app = Router::new()
            .route("/fixed/:size", get(fixed))
            .route("/drip", get(drip))
            .route("/stall", get(stall))
            .route("/truncated", get(truncated))
            .route("/status/:code", get(status));
        let addr = serve(app).await;
        Self { addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve `router` on 127.0.0.1 with an ephemeral port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn fixed(Path(size): Path<usize>) -> Vec<u8> {
    vec![b'x'; size]
}

async fn drip() -> Body {
    let bytes = stream::unfold(0u32, |sent| async move {
        if sent >= 120 {
            return None;
        }
        if sent > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Some((Ok::<_, Infallible>(Bytes::from_static(b"x")), sent + 1))
    });
    Body::from_stream(bytes)
}

async fn stall() -> Body {
    let first = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"x")) });
    Body::from_stream(first.chain(stream::pending()))
}

async fn truncated() -> Response {
    let chunks = stream::iter(vec![
        Ok(Bytes::from(vec![b'x'; 10])),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "origin went away")),
    ]);
    let mut response = Response::new(Body::from_stream(chunks));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("100"));
    response
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// What the recording ingestor saw for one download.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub params: JobParams,
}

/// Reads every body into memory and hands out sequential resource ids.
#[derive(Default)]
pub struct RecordingIngestor {
    pub seen: Mutex<Vec<Ingested>>,
}

#[async_trait]
impl ResourceIngestor for RecordingIngestor {
    async fn ingest(&self, mut reader: BodyReader, filename: &str, params: &JobParams) -> anyhow::Result<ResourceHandle> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let mut seen = self.seen.lock().unwrap();
        seen.push(Ingested {
            filename: filename.to_string(),
            bytes,
            params: params.clone(),
        });
        Ok(ResourceHandle::new(format!("res-{}", seen.len())))
    }
}

pub fn manager_with(config: QueueConfig) -> (DownloadManager, Arc<RecordingIngestor>) {
    let ingestor = Arc::new(RecordingIngestor::default());
    let manager = DownloadManager::new(config, ingestor.clone()).unwrap();
    (manager, ingestor)
}

pub fn manager() -> (DownloadManager, Arc<RecordingIngestor>) {
    manager_with(QueueConfig::default())
}

/// Collect events for job `id` until one satisfies `done`. Panics after
/// `within`.
pub async fn wait_for(
    sub: &mut Subscription,
    id: &str,
    within: Duration,
    done: impl Fn(&JobView) -> bool,
) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(within, async {
        while let Some(event) = sub.recv().await {
            if event.job.id != id {
                continue;
            }
            let finished = done(&event.job);
            seen.push(event);
            if finished {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "job {id} did not reach the expected state in {within:?}: {seen:#?}");
    seen
}
