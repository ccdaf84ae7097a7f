// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job types: status, ingest parameters, wire views and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Error string recorded on jobs that were cancelled by a user or by shutdown.
pub const CANCELLED_SENTINEL: &str = "download cancelled";

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting for a worker slot
    Pending,
    /// Reading the response body
    Downloading,
    /// Body fully read, ingestor finishing up
    Processing,
    /// Stored as a resource
    Completed,
    /// Transport or ingest failure
    Failed,
    /// Cancelled by a user or by shutdown
    Cancelled,
    /// Paused by a user, waiting for resume
    Paused,
}

impl JobStatus {
    /// Returns true for statuses a worker is (or will be) driving.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Downloading | JobStatus::Processing)
    }

    /// Returns true for statuses that carry a completion timestamp.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether the lifecycle admits a direct move from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Pending, Paused)
                | (Downloading, Processing)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Downloading, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied parameters handed through to the ingestor untouched.
///
/// Field names follow the submit form (`OwnerId`, `Tags`, ...). List fields
/// accept either a JSON array or a comma-separated string, so the same struct
/// deserializes from a JSON body and from an urlencoded form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct JobParams {
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default, alias = "Tags[]", deserialize_with = "id_list")]
    pub tags: Vec<u64>,
    #[serde(default, alias = "Groups[]", deserialize_with = "id_list")]
    pub groups: Vec<u64>,
    #[serde(default, alias = "Notes[]", deserialize_with = "id_list")]
    pub notes: Vec<u64>,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub content_category: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdList {
    Many(Vec<u64>),
    One(u64),
    Joined(String),
}

fn id_list<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IdList>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(IdList::Many(ids)) => Ok(ids),
        Some(IdList::One(id)) => Ok(vec![id]),
        Some(IdList::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u64>().map_err(serde::de::Error::custom))
            .collect(),
    }
}

/// Observable view of a job, as sent to subscribers and HTTP clients.
///
/// This is always a copy; holding one never pins the live job.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    /// Bytes read so far
    pub progress: u64,
    /// Declared size, `-1` when the remote did not send one
    pub total_size: i64,
    /// `-1` when the total size is unknown
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Kind of change a [`JobEvent`] reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Removed => "removed",
        }
    }
}

/// A state change of one job, carrying the job as it looked at that moment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job: JobView,
}

impl JobEvent {
    pub fn new(kind: EventKind, job: JobView) -> Self {
        Self { kind, job }
    }
}

/// Derive the percentage shown for `downloaded` out of `total` bytes.
///
/// Unknown totals yield `-1`. An empty body counts as fully downloaded.
pub fn percent_of(downloaded: u64, total: i64) -> f64 {
    if total < 0 {
        -1.0
    } else if total == 0 {
        100.0
    } else {
        ((downloaded as f64 / total as f64) * 100.0).min(100.0)
    }
}
