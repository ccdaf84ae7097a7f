// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The download job: identity, lifecycle state and cancellation handle.
//!
//! Every mutation takes the per-job lock, checks the lifecycle table, and
//! publishes the resulting `updated` event before releasing the lock. Events
//! for one job therefore leave in the same order the state changed, and a
//! terminal state is never observable before its event has been offered.
//!
//! Worker-side mutators carry the run generation from the [`RunTicket`] the
//! worker started with. Resume and retry bump the generation, so a worker
//! still unwinding from a superseded run cannot clobber the new one.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::events::EventBus;
use super::types::{percent_of, EventKind, JobEvent, JobParams, JobStatus, JobView, CANCELLED_SENTINEL};
use crate::sync::resilient_lock;

/// Rejected job mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobStateError {
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id}: run {generation} was superseded")]
    Stale { id: String, generation: u64 },
}

/// What a worker needs to drive one run of a job.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    downloaded: u64,
    total: i64,
    percent: f64,
    error: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    resource_id: Option<String>,
    token: CancellationToken,
    generation: u64,
}

impl JobState {
    fn fresh() -> Self {
        Self {
            status: JobStatus::Pending,
            downloaded: 0,
            total: -1,
            percent: -1.0,
            error: String::new(),
            started_at: None,
            completed_at: None,
            resource_id: None,
            token: CancellationToken::new(),
            generation: 0,
        }
    }

    fn set_progress(&mut self, downloaded: u64, total: i64) {
        self.downloaded = self.downloaded.max(downloaded);
        self.total = total;
        self.percent = percent_of(self.downloaded, self.total);
    }

    /// Enter a terminal status: stamp completion and fire the token.
    fn seal(&mut self, status: JobStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.token.cancel();
    }
}

/// A queued download. Owned by the manager; workers hold an `Arc` for the
/// duration of one run.
#[derive(Debug)]
pub struct Job {
    id: String,
    url: String,
    created_at: DateTime<Utc>,
    params: JobParams,
    bus: EventBus,
    state: Mutex<JobState>,
}

impl Job {
    /// Create a pending job with a fresh cancellation token.
    pub fn new(id: impl Into<String>, url: impl Into<String>, params: JobParams, bus: EventBus) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            created_at: Utc::now(),
            params,
            bus,
            state: Mutex::new(JobState::fresh()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn status(&self) -> JobStatus {
        resilient_lock(&self.state).status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        resilient_lock(&self.state).completed_at
    }

    /// The current run's cancellation token.
    pub fn token(&self) -> CancellationToken {
        resilient_lock(&self.state).token.clone()
    }

    pub fn ticket(&self) -> RunTicket {
        let state = resilient_lock(&self.state);
        RunTicket {
            generation: state.generation,
            token: state.token.clone(),
        }
    }

    /// Immutable copy of the observable fields.
    pub fn snapshot(&self) -> JobView {
        let state = resilient_lock(&self.state);
        self.view(&state)
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn can_pause(&self) -> bool {
        matches!(self.status(), JobStatus::Pending | JobStatus::Downloading)
    }

    pub fn can_resume(&self) -> bool {
        self.status() == JobStatus::Paused
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status(), JobStatus::Failed | JobStatus::Cancelled)
    }

    // ------------------------------------------------------------------
    // Worker-side mutators
    // ------------------------------------------------------------------

    /// `pending → downloading`; records `startedAt`.
    pub fn start(&self, generation: u64) -> Result<JobView, JobStateError> {
        self.mutate(Some(generation), |state| {
            self.check(state, JobStatus::Downloading)?;
            state.status = JobStatus::Downloading;
            state.started_at = Some(Utc::now());
            state.set_progress(0, -1);
            Ok(true)
        })
    }

    /// Record the size the remote declared (`-1` if unknown).
    pub fn set_total(&self, generation: u64, total: i64) -> Result<JobView, JobStateError> {
        self.mutate(Some(generation), |state| {
            if state.status != JobStatus::Downloading {
                return Ok(false);
            }
            let downloaded = state.downloaded;
            state.set_progress(downloaded, total);
            Ok(true)
        })
    }

    /// Record bytes read so far. Publishes only when `publish` is set; the
    /// counters are updated either way. Ignored once the job left
    /// `downloading` (paused mid-read, for instance).
    pub fn record_progress(&self, generation: u64, downloaded: u64, publish: bool) -> Result<JobView, JobStateError> {
        self.mutate(Some(generation), |state| {
            if state.status != JobStatus::Downloading {
                return Ok(false);
            }
            let total = state.total;
            state.set_progress(downloaded, total);
            Ok(publish)
        })
    }

    /// `downloading → processing` once the body hit end-of-stream.
    pub fn finish_download(&self, generation: u64, downloaded: u64) -> Result<JobView, JobStateError> {
        self.mutate(Some(generation), |state| {
            self.check(state, JobStatus::Processing)?;
            let total = state.total;
            state.set_progress(downloaded, total);
            state.status = JobStatus::Processing;
            Ok(true)
        })
    }

    /// `processing → completed` with the stored resource id.
    pub fn complete(&self, generation: u64, resource_id: impl Into<String>) -> Result<JobView, JobStateError> {
        self.mutate(Some(generation), |state| {
            self.check(state, JobStatus::Completed)?;
            state.resource_id = Some(resource_id.into());
            state.error.clear();
            state.seal(JobStatus::Completed);
            Ok(true)
        })
    }

    /// Move to `failed` with `message`.
    pub fn fail(&self, generation: u64, message: impl Into<String>) -> Result<JobView, JobStateError> {
        let message = message.into();
        self.mutate(Some(generation), |state| {
            self.check(state, JobStatus::Failed)?;
            state.error = non_empty(message, "download failed");
            state.seal(JobStatus::Failed);
            Ok(true)
        })
    }

    /// React to the run's token having fired.
    ///
    /// A paused job keeps its status and nothing is published; otherwise the
    /// job moves to `cancelled` with the sentinel error. Returns whether the
    /// job was cancelled.
    pub fn observe_cancellation(&self, generation: u64) -> Result<bool, JobStateError> {
        let (_, cancelled) = self.mutate_with(Some(generation), |state| {
            if state.status == JobStatus::Paused {
                return Ok((false, false));
            }
            self.check(state, JobStatus::Cancelled)?;
            state.error = CANCELLED_SENTINEL.to_string();
            state.seal(JobStatus::Cancelled);
            Ok((true, true))
        })?;
        Ok(cancelled)
    }

    /// Force `failed` from any non-terminal, non-paused status. Used when a
    /// worker task died without reaching a terminal state.
    pub fn fault(&self, generation: u64, message: impl Into<String>) -> Result<JobView, JobStateError> {
        let message = message.into();
        self.mutate(Some(generation), |state| {
            if !state.status.is_active() {
                return Ok(false);
            }
            state.error = non_empty(message, "worker failed");
            state.seal(JobStatus::Failed);
            Ok(true)
        })
    }

    // ------------------------------------------------------------------
    // Manager-side mutators
    // ------------------------------------------------------------------

    /// `pending|downloading → paused`, firing the current token.
    pub fn pause(&self) -> Result<JobView, JobStateError> {
        self.mutate(None, |state| {
            self.check(state, JobStatus::Paused)?;
            state.status = JobStatus::Paused;
            state.token.cancel();
            Ok(true)
        })
    }

    /// `paused → cancelled`. No worker is driving a paused job, so the
    /// transition is recorded directly.
    pub fn cancel_paused(&self) -> Result<JobView, JobStateError> {
        self.mutate(None, |state| {
            if state.status != JobStatus::Paused {
                return Err(self.invalid(state, JobStatus::Cancelled));
            }
            state.error = CANCELLED_SENTINEL.to_string();
            state.seal(JobStatus::Cancelled);
            Ok(true)
        })
    }

    /// `paused|failed|cancelled → pending` for a new run.
    ///
    /// Installs a fresh token, bumps the generation, and resets the error
    /// slot, the timestamps and the progress counters.
    pub fn requeue(&self) -> Result<RunTicket, JobStateError> {
        let (_, ticket) = self.mutate_with(None, |state| {
            self.check(state, JobStatus::Pending)?;
            state.status = JobStatus::Pending;
            state.error.clear();
            state.started_at = None;
            state.completed_at = None;
            state.resource_id = None;
            state.downloaded = 0;
            state.set_progress(0, -1);
            state.token = CancellationToken::new();
            state.generation += 1;
            let ticket = RunTicket {
                generation: state.generation,
                token: state.token.clone(),
            };
            Ok((true, ticket))
        })?;
        Ok(ticket)
    }

    // ------------------------------------------------------------------

    /// Run `f` under the job lock. When it returns `Ok(true)` the new state
    /// is published as `updated` before the lock is released.
    fn mutate<F>(&self, generation: Option<u64>, f: F) -> Result<JobView, JobStateError>
    where
        F: FnOnce(&mut JobState) -> Result<bool, JobStateError>,
    {
        self.mutate_with(generation, |state| f(state).map(|publish| (publish, ())))
            .map(|(view, ())| view)
    }

    fn mutate_with<T, F>(&self, generation: Option<u64>, f: F) -> Result<(JobView, T), JobStateError>
    where
        F: FnOnce(&mut JobState) -> Result<(bool, T), JobStateError>,
    {
        let mut state = resilient_lock(&self.state);
        if let Some(generation) = generation {
            if state.generation != generation {
                return Err(JobStateError::Stale {
                    id: self.id.clone(),
                    generation,
                });
            }
        }
        let (publish, out) = f(&mut state)?;
        let view = self.view(&state);
        if publish {
            self.bus.publish(JobEvent::new(EventKind::Updated, view.clone()));
        }
        Ok((view, out))
    }

    fn check(&self, state: &JobState, to: JobStatus) -> Result<(), JobStateError> {
        if state.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(self.invalid(state, to))
        }
    }

    fn invalid(&self, state: &JobState, to: JobStatus) -> JobStateError {
        JobStateError::InvalidTransition {
            id: self.id.clone(),
            from: state.status,
            to,
        }
    }

    fn view(&self, state: &JobState) -> JobView {
        JobView {
            id: self.id.clone(),
            url: self.url.clone(),
            status: state.status,
            progress: state.downloaded,
            total_size: state.total,
            progress_percent: state.percent,
            error: state.error.clone(),
            resource_id: state.resource_id.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }

    /// Build a job already in `status`, as if it had run earlier. Keeps the
    /// terminal-state invariants (timestamp, token, error, resource id).
    #[cfg(test)]
    pub(crate) fn restored(
        id: &str,
        status: JobStatus,
        created_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
        bus: EventBus,
    ) -> Self {
        let mut state = JobState::fresh();
        state.status = status;
        if status.is_terminal() {
            state.completed_at = Some(completed_at.unwrap_or_else(Utc::now));
            state.token.cancel();
        }
        match status {
            JobStatus::Completed => state.resource_id = Some(format!("res-{id}")),
            JobStatus::Failed => state.error = "server responded 500 Internal Server Error".into(),
            JobStatus::Cancelled => state.error = CANCELLED_SENTINEL.into(),
            JobStatus::Paused => state.token.cancel(),
            _ => {}
        }
        Self {
            id: id.to_string(),
            url: format!("http://example.test/{id}"),
            created_at,
            params: JobParams::default(),
            bus,
            state: Mutex::new(state),
        }
    }
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
