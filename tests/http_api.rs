// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP surface tests: a real listener, driven with reqwest.

mod common;

use std::time::Duration;

use common::{manager, manager_with, serve, wait_for, Origin};
use fetchq::config::QueueConfig;
use fetchq::download::{DownloadManager, JobStatus};
use fetchq::server::Server;
use axum::body::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

async fn api(manager: &DownloadManager) -> String {
    let addr = serve(Server::new(manager.clone()).build_router()).await;
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let (manager, _ingestor) = manager();
    let base = api(&manager).await;

    let response = Client::new().get(format!("{base}/health")).send().await?;
    assert_eq!(response.status(), 200);

    let json: Value = response.json().await?;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["jobs"], 0);
    assert_eq!(json["active"], 0);
    Ok(())
}

#[tokio::test]
async fn test_submit_form_and_list_queue() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, ingestor) = manager();
    let base = api(&manager).await;
    let client = Client::new();
    let mut sub = manager.subscribe();

    let urls = format!("{}\n\n  {}  \n", origin.url("/fixed/10"), origin.url("/fixed/20"));
    let response = client
        .post(format!("{base}/download/submit"))
        .form(&[("URL", urls.as_str()), ("OwnerId", "3"), ("Tags[]", "1"), ("Tags[]", "2")])
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let json: Value = response.json().await?;
    assert_eq!(json["queued"], true);
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["status"], "pending");
    assert_eq!(jobs[0]["progressPercent"], -1.0);
    assert_eq!(jobs[0]["totalSize"], -1);
    assert!(jobs[0].get("error").is_none());
    assert!(json.get("error").is_none());

    for job in jobs {
        let id = job["id"].as_str().unwrap();
        wait_for(&mut sub, id, Duration::from_secs(10), |j| j.status.is_terminal()).await;
    }

    let queue: Value = client.get(format!("{base}/download/queue")).send().await?.json().await?;
    let listed = queue["jobs"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], jobs[0]["id"]);
    assert_eq!(listed[0]["status"], "completed");
    assert_eq!(listed[1]["progress"], 20);
    assert!(listed[1]["resourceId"].is_string());

    let seen = ingestor.seen.lock().unwrap();
    assert_eq!(seen[0].params.owner_id, Some(3));
    assert_eq!(seen[0].params.tags, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_submit_json() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, _ingestor) = manager();
    let base = api(&manager).await;

    let response = Client::new()
        .post(format!("{base}/download/submit"))
        .json(&json!({"URL": origin.url("/fixed/4"), "FileName": "four.bin", "Groups": [5]}))
        .send()
        .await?;
    assert_eq!(response.status(), 202);
    let json: Value = response.json().await?;
    assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_submit_without_url_is_bad_request() -> Result<(), Box<dyn std::error::Error>> {
    let (manager, _ingestor) = manager();
    let base = api(&manager).await;

    let response = Client::new()
        .post(format!("{base}/download/submit"))
        .form(&[("URL", "  \n ")])
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    let json: Value = response.json().await?;
    assert_eq!(json["status"], 400);
    assert_eq!(json["error"]["error_type"], "invalid_request");
    assert!(json["error"]["reference"].as_str().unwrap().starts_with("ERR-"));
    assert!(manager.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_full_queue_is_service_unavailable() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, _ingestor) = manager_with(QueueConfig {
        capacity: 1,
        ..QueueConfig::default()
    });
    let base = api(&manager).await;
    let client = Client::new();

    let submit = |url: String| {
        client
            .post(format!("{base}/download/submit"))
            .form(&[("URL", url)])
            .send()
    };
    assert_eq!(submit(origin.url("/drip")).await?.status(), 202);

    let response = submit(origin.url("/drip")).await?;
    assert_eq!(response.status(), 503);
    let json: Value = response.json().await?;
    assert_eq!(json["error"]["error_type"], "service_unavailable");

    manager.shutdown().await;
    assert_eq!(submit(origin.url("/drip")).await?.status(), 503);
    Ok(())
}

#[tokio::test]
async fn test_partial_batch_is_accepted_with_error() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, _ingestor) = manager_with(QueueConfig {
        capacity: 1,
        ..QueueConfig::default()
    });
    let base = api(&manager).await;

    let urls = format!("{}\n{}", origin.url("/drip"), origin.url("/drip"));
    let response = Client::new()
        .post(format!("{base}/download/submit"))
        .form(&[("URL", urls)])
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let json: Value = response.json().await?;
    assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
    assert!(json["error"].as_str().unwrap().contains("queue full"));
    Ok(())
}

#[tokio::test]
async fn test_control_endpoints() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, _ingestor) = manager();
    let base = api(&manager).await;
    let client = Client::new();
    let mut sub = manager.subscribe();

    let response = client.post(format!("{base}/download/cancel?id=nope")).send().await?;
    assert_eq!(response.status(), 404);

    let response = client.post(format!("{base}/download/cancel")).send().await?;
    assert_eq!(response.status(), 400);

    let job = manager.submit(&origin.url("/drip"), Default::default())?;
    wait_for(&mut sub, &job.id, Duration::from_secs(5), |j| j.status == JobStatus::Downloading).await;

    let response = client
        .post(format!("{base}/download/pause"))
        .form(&[("id", job.id.as_str())])
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await?["status"], "paused");

    let response = client.post(format!("{base}/download/resume?id={}", job.id)).send().await?;
    assert_eq!(response.json::<Value>().await?["status"], "pending");

    let response = client.post(format!("{base}/download/retry?id={}", job.id)).send().await?;
    assert_eq!(response.status(), 409);

    let response = client.post(format!("{base}/download/cancel?id={}", job.id)).send().await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await?["status"], "cancelled");
    wait_for(&mut sub, &job.id, Duration::from_secs(2), |j| j.status.is_terminal()).await;

    let response = client.post(format!("{base}/download/cancel?id={}", job.id)).send().await?;
    assert_eq!(response.status(), 409);
    let json: Value = response.json().await?;
    assert!(json["error"]["message"].as_str().unwrap().contains("already finished"));

    let response = client.post(format!("{base}/download/retry?id={}", job.id)).send().await?;
    assert_eq!(response.json::<Value>().await?["status"], "pending");

    manager.shutdown().await;
    Ok(())
}

/// Read SSE frames until `done` holds for the accumulated text.
async fn read_until(
    stream: &mut (impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin),
    text: &mut String,
    done: impl Fn(&str) -> bool,
) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !done(text.as_str()) {
            match stream.next().await {
                Some(Ok(chunk)) => text.push_str(&String::from_utf8_lossy(&chunk)),
                _ => return,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "event stream did not deliver in time: {text}");
}

#[tokio::test]
async fn test_event_stream_sends_snapshot_then_live_events() -> Result<(), Box<dyn std::error::Error>> {
    let origin = Origin::start().await;
    let (manager, _ingestor) = manager();
    let base = api(&manager).await;

    let first = manager.submit(&origin.url("/drip"), Default::default())?;

    let response = Client::new().get(format!("{base}/download/events")).send().await?;
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert!(headers["content-type"].to_str()?.starts_with("text/event-stream"));
    assert_eq!(headers["x-accel-buffering"], "no");
    assert_eq!(headers["cache-control"], "no-cache");

    let mut stream = Box::pin(response.bytes_stream());
    let mut text = String::new();
    read_until(&mut stream, &mut text, |t| t.contains("event: init")).await;
    assert!(text.contains(&first.id));

    let second = manager.submit(&origin.url("/fixed/8"), Default::default())?;
    read_until(&mut stream, &mut text, |t| t.contains("event: added")).await;
    assert!(text.contains(r#""type":"added""#));
    assert!(text.contains(&second.id));

    read_until(&mut stream, &mut text, |t| t.contains(r#""status":"completed""#)).await;

    // Shutdown ends the stream.
    manager.shutdown().await;
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;
    assert!(ended.is_ok());
    Ok(())
}
