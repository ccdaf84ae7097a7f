// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SSE event stream.
//!
//! GET /download/events
//!
//! Every connection starts with one `init` frame holding the full job list,
//! then forwards `added`/`updated`/`removed` events as they are published.
//! The subscription is taken before the snapshot, so nothing published in
//! between is lost. A client that dropped events reconciles by reconnecting.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::stream::{self, Stream, StreamExt};

use super::{AppState, QueueSnapshot};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn events_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = event_stream(&state);
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive")),
    )
}

fn event_stream(state: &AppState) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let subscription = state.manager.subscribe();
    let snapshot = QueueSnapshot {
        jobs: state.manager.list(),
    };
    tracing::debug!(jobs = snapshot.jobs.len(), "Event stream connected");

    let init = stream::once(async move { Event::default().event("init").json_data(&snapshot) });

    // Ends when the bus closes; dropping the stream drops the subscription.
    let live = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = Event::default().event(event.kind.as_str()).json_data(&event);
        Some((frame, subscription))
    });

    init.chain(live).filter_map(|frame| async move {
        match frame {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Failed to encode SSE frame: {}", e);
                None
            }
        }
    })
}
