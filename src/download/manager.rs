// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: job table, admission, control commands and retention.
//!
//! The job table is an insertion-ordered map, so id lookup and the
//! insertion-order sequence can never disagree on membership. It sits behind
//! one mutex that is only held for table mutations and status reads, never
//! across I/O. Event publication happens under it; it never blocks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, Subscription};
use super::ingest::ResourceIngestor;
use super::job::{Job, RunTicket};
use super::types::{EventKind, JobEvent, JobParams, JobStatus, JobView};
use super::worker::{self, WorkerContext};
use crate::config::QueueConfig;
use crate::error::{FetchError, QueueError};
use crate::sync::resilient_lock;

/// How long shutdown waits for in-flight workers to let go of their slots.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Partial admission of a multi-URL submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchError {
    /// Jobs admitted before the failure
    pub admitted: Vec<JobView>,
    pub error: QueueError,
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after admitting {} jobs)", self.error, self.admitted.len())
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

struct Inner {
    config: QueueConfig,
    jobs: Mutex<IndexMap<String, Arc<Job>>>,
    bus: EventBus,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
    id_seq: AtomicU32,
    id_salt: u32,
}

/// Owns the download queue. Cheap to clone; clones share the same queue.
///
/// Must be created inside a Tokio runtime: construction starts the retention
/// sweeper and every admitted job gets its own task.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(config: QueueConfig, ingestor: Arc<dyn ResourceIngestor>) -> Result<Self, FetchError> {
        let ctx = Arc::new(WorkerContext::new(&config, ingestor)?);
        let mut rng = rand::thread_rng();
        let manager = Self {
            inner: Arc::new(Inner {
                bus: EventBus::new(config.event_buffer()),
                jobs: Mutex::new(IndexMap::new()),
                ctx,
                shutdown: CancellationToken::new(),
                id_seq: AtomicU32::new(rng.gen()),
                id_salt: rng.gen(),
                config,
            }),
        };
        manager.start_sweeper();
        tracing::info!(
            workers = manager.inner.config.workers(),
            capacity = manager.inner.config.capacity(),
            "Download manager started"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to `added`/`updated`/`removed` events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// All jobs in insertion order.
    pub fn list(&self) -> Vec<JobView> {
        let jobs = resilient_lock(&self.inner.jobs);
        jobs.values().map(|job| job.snapshot()).collect()
    }

    pub fn get(&self, id: &str) -> Option<JobView> {
        resilient_lock(&self.inner.jobs).get(id).map(|job| job.snapshot())
    }

    /// Number of jobs currently driven by a worker.
    pub fn active_count(&self) -> usize {
        resilient_lock(&self.inner.jobs)
            .values()
            .filter(|job| job.is_active())
            .count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Admit one URL, evicting finished history if the table is full.
    pub fn submit(&self, url: &str, params: JobParams) -> Result<JobView, QueueError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(QueueError::UrlRequired);
        }

        let mut jobs = resilient_lock(&self.inner.jobs);
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }

        let capacity = self.inner.config.capacity();
        while jobs.len() >= capacity {
            let Some(victim) = eviction_candidate(&jobs) else {
                tracing::warn!(capacity, url, "Queue full, rejecting submission");
                return Err(QueueError::QueueFull { capacity });
            };
            if let Some(evicted) = jobs.shift_remove(&victim) {
                tracing::debug!(job_id = %victim, status = %evicted.status(), "Evicted to make room");
                self.inner
                    .bus
                    .publish(JobEvent::new(EventKind::Removed, evicted.snapshot()));
            }
        }

        let id = self.next_id(&jobs);
        let job = Arc::new(Job::new(id.clone(), url, params, self.inner.bus.clone()));
        let view = job.snapshot();
        let ticket = job.ticket();
        jobs.insert(id.clone(), Arc::clone(&job));
        self.inner.bus.publish(JobEvent::new(EventKind::Added, view.clone()));
        self.spawn_worker(job, ticket);

        tracing::info!(job_id = %id, url, "Download queued");
        Ok(view)
    }

    /// Admit every non-empty line of `urls`, in order.
    ///
    /// Stops at the first failure. If nothing was admitted yet the error
    /// comes back with an empty `admitted` list.
    pub fn submit_multiple(&self, urls: &str, params: &JobParams) -> Result<Vec<JobView>, BatchError> {
        let mut admitted = Vec::new();
        for url in urls.lines().map(str::trim).filter(|u| !u.is_empty()) {
            match self.submit(url, params.clone()) {
                Ok(view) => admitted.push(view),
                Err(error) => return Err(BatchError { admitted, error }),
            }
        }
        if admitted.is_empty() {
            return Err(BatchError {
                admitted,
                error: QueueError::UrlRequired,
            });
        }
        Ok(admitted)
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Signal an active job's token; the worker records the cancellation.
    /// Paused jobs have no worker and are cancelled directly.
    pub fn cancel(&self, id: &str) -> Result<(), QueueError> {
        let jobs = resilient_lock(&self.inner.jobs);
        let job = jobs.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        match job.status() {
            status if status.is_active() => {
                job.token().cancel();
                tracing::info!(job_id = %id, "Cancellation requested");
                Ok(())
            }
            JobStatus::Paused => {
                job.cancel_paused()
                    .map_err(|_| QueueError::AlreadyFinished(id.to_string()))?;
                tracing::info!(job_id = %id, "Paused download cancelled");
                Ok(())
            }
            _ => Err(QueueError::AlreadyFinished(id.to_string())),
        }
    }

    /// Pause a pending or downloading job. It keeps its queue position.
    pub fn pause(&self, id: &str) -> Result<JobView, QueueError> {
        let jobs = resilient_lock(&self.inner.jobs);
        let job = jobs.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let view = job.pause().map_err(|_| QueueError::NotPausable(id.to_string()))?;
        tracing::info!(job_id = %id, "Download paused");
        Ok(view)
    }

    /// Re-queue a paused job from scratch.
    pub fn resume(&self, id: &str) -> Result<JobView, QueueError> {
        self.requeue(id, JobStatus::Paused, || QueueError::NotPaused(id.to_string()))
    }

    /// Re-queue a failed or cancelled job from scratch.
    pub fn retry(&self, id: &str) -> Result<JobView, QueueError> {
        self.requeue(id, JobStatus::Failed, || QueueError::NotRetryable(id.to_string()))
    }

    fn requeue(
        &self,
        id: &str,
        from: JobStatus,
        not_allowed: impl FnOnce() -> QueueError,
    ) -> Result<JobView, QueueError> {
        let jobs = resilient_lock(&self.inner.jobs);
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        let job = jobs.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let allowed = match from {
            JobStatus::Paused => job.can_resume(),
            _ => job.can_retry(),
        };
        if !allowed {
            return Err(not_allowed());
        }
        let previous = job.status();
        let ticket = job.requeue().map_err(|_| not_allowed())?;
        self.spawn_worker(Arc::clone(job), ticket);
        tracing::info!(job_id = %id, from = %previous, "Download re-queued");
        Ok(job.snapshot())
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Evict long-finished and long-paused jobs. Returns the evicted ids in
    /// insertion order.
    pub fn sweep_now(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let completed_cutoff = now - to_chrono(self.inner.config.completed_retention());
        let paused_cutoff = now - to_chrono(self.inner.config.paused_retention());

        let mut jobs = resilient_lock(&self.inner.jobs);
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| match job.status() {
                status if status.is_terminal() => job
                    .completed_at()
                    .map_or(false, |done| done < completed_cutoff),
                JobStatus::Paused => job.created_at() < paused_cutoff,
                _ => false,
            })
            .map(|job| job.id().to_string())
            .collect();

        for id in &expired {
            if let Some(job) = jobs.shift_remove(id) {
                self.inner
                    .bus
                    .publish(JobEvent::new(EventKind::Removed, job.snapshot()));
            }
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), remaining = jobs.len(), "Retention sweep");
        }
        expired
    }

    fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        DownloadManager { inner }.sweep_now();
                    }
                }
            }
            tracing::debug!("Retention sweeper stopped");
        });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the sweeper, refuse new work, cancel every active job, wait for
    /// workers to let go of their slots, then end all subscriptions.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let active: Vec<Arc<Job>> = {
            let jobs = resilient_lock(&self.inner.jobs);
            self.inner.shutdown.cancel();
            jobs.values().filter(|job| job.is_active()).cloned().collect()
        };
        tracing::info!(active = active.len(), "Shutting down download manager");
        for job in &active {
            job.token().cancel();
        }

        let workers = self.inner.config.workers() as u32;
        let semaphore = Arc::clone(&self.inner.ctx.semaphore);
        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, semaphore.acquire_many(workers)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!("Workers did not drain before the shutdown deadline"),
        }
        semaphore.close();
        self.inner.bus.close();
    }

    // ------------------------------------------------------------------

    /// Short opaque id: a scrambled sequence number, so ids never repeat
    /// within 2^32 submissions, even after their jobs are evicted.
    fn next_id(&self, jobs: &IndexMap<String, Arc<Job>>) -> String {
        loop {
            let n = self.inner.id_seq.fetch_add(1, Ordering::Relaxed);
            let id = format!("{:08x}", n.wrapping_mul(0x9E37_79B1) ^ self.inner.id_salt);
            if !jobs.contains_key(&id) {
                return id;
            }
        }
    }

    /// Run the job on its own task, and turn a panicking worker into a
    /// failed job instead of a silently stuck one.
    fn spawn_worker(&self, job: Arc<Job>, ticket: RunTicket) {
        let generation = ticket.generation;
        let handle = tokio::spawn(worker::run(Arc::clone(&self.inner.ctx), Arc::clone(&job), ticket));
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    tracing::error!(job_id = %job.id(), panic = %message, "Download worker panicked");
                    let _ = job.fault(generation, format!("worker panicked: {message}"));
                }
            }
        });
    }

    #[cfg(test)]
    fn insert_restored(&self, job: Job) {
        let job = Arc::new(job);
        let mut jobs = resilient_lock(&self.inner.jobs);
        jobs.insert(job.id().to_string(), job);
    }
}

/// Oldest `completed` job, else oldest `failed`/`cancelled` job.
fn eviction_candidate(jobs: &IndexMap<String, Arc<Job>>) -> Option<String> {
    let first = |wanted: &dyn Fn(JobStatus) -> bool| {
        jobs.values()
            .find(|job| wanted(job.status()))
            .map(|job| job.id().to_string())
    };
    first(&|status| status == JobStatus::Completed)
        .or_else(|| first(&|status| matches!(status, JobStatus::Failed | JobStatus::Cancelled)))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ingest::{BodyReader, ResourceHandle};
    use crate::download::types::CANCELLED_SENTINEL;
    use async_trait::async_trait;

    struct NullIngestor;

    #[async_trait]
    impl ResourceIngestor for NullIngestor {
        async fn ingest(&self, _reader: BodyReader, _filename: &str, _params: &JobParams) -> anyhow::Result<ResourceHandle> {
            Ok(ResourceHandle::new("null"))
        }
    }

    // Nothing listens on the discard port, so workers fail fast.
    const DEAD_URL: &str = "http://127.0.0.1:9/file.bin";

    fn manager(capacity: usize) -> DownloadManager {
        let config = QueueConfig {
            capacity,
            connect_timeout_secs: 1,
            ..QueueConfig::default()
        };
        DownloadManager::new(config, Arc::new(NullIngestor)).unwrap()
    }

    fn restored(manager: &DownloadManager, id: &str, status: JobStatus, completed_ago: Option<chrono::Duration>) -> Job {
        let now = Utc::now();
        Job::restored(id, status, now, completed_ago.map(|ago| now - ago), manager.inner.bus.clone())
    }

    fn drain(sub: &mut Subscription) -> Vec<(EventKind, String)> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push((event.kind, event.job.id));
        }
        events
    }

    #[tokio::test]
    async fn test_submit_trims_and_rejects_empty() {
        let manager = manager(10);
        assert_eq!(manager.submit("   ", JobParams::default()), Err(QueueError::UrlRequired));
        let view = manager.submit("  http://127.0.0.1:9/a.bin \n", JobParams::default()).unwrap();
        assert_eq!(view.url, "http://127.0.0.1:9/a.bin");
        assert_eq!(view.id.len(), 8);
        assert!(view.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_admission_order_matches_sequence_and_events() {
        let manager = manager(10);
        let mut sub = manager.subscribe();
        let a = manager.submit(DEAD_URL, JobParams::default()).unwrap();
        let b = manager.submit(DEAD_URL, JobParams::default()).unwrap();
        assert_ne!(a.id, b.id);

        let ids: Vec<String> = manager.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        let added: Vec<String> = drain(&mut sub)
            .into_iter()
            .filter(|(kind, _)| *kind == EventKind::Added)
            .map(|(_, id)| id)
            .collect();
        assert_eq!(added, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_eviction_prefers_oldest_completed() {
        let manager = manager(100);
        manager.insert_restored(restored(&manager, "failed00", JobStatus::Failed, Some(chrono::Duration::minutes(1))));
        for i in 0..99 {
            let id = format!("done{i:04}");
            manager.insert_restored(restored(&manager, &id, JobStatus::Completed, Some(chrono::Duration::minutes(1))));
        }
        let mut sub = manager.subscribe();

        let view = manager.submit(DEAD_URL, JobParams::default()).unwrap();

        let events = drain(&mut sub);
        assert_eq!(events[0], (EventKind::Removed, "done0000".to_string()));
        assert_eq!(events[1], (EventKind::Added, view.id.clone()));

        let list = manager.list();
        assert_eq!(list.len(), 100);
        assert_eq!(list[0].id, "failed00");
        assert_eq!(list.last().unwrap().id, view.id);
        assert!(manager.get("done0000").is_none());
    }

    #[tokio::test]
    async fn test_eviction_falls_back_to_failed_or_cancelled() {
        let manager = manager(3);
        manager.insert_restored(restored(&manager, "paused01", JobStatus::Paused, None));
        manager.insert_restored(restored(&manager, "cancel01", JobStatus::Cancelled, None));
        manager.insert_restored(restored(&manager, "failed01", JobStatus::Failed, None));
        let mut sub = manager.subscribe();

        manager.submit(DEAD_URL, JobParams::default()).unwrap();
        assert_eq!(drain(&mut sub)[0], (EventKind::Removed, "cancel01".to_string()));
        assert!(manager.get("failed01").is_some());
    }

    #[tokio::test]
    async fn test_full_of_live_jobs_rejects_without_events() {
        let manager = manager(100);
        let statuses = [JobStatus::Pending, JobStatus::Downloading, JobStatus::Paused];
        for i in 0..100 {
            let id = format!("live{i:04}");
            manager.insert_restored(restored(&manager, &id, statuses[i % 3], None));
        }
        let mut sub = manager.subscribe();

        let err = manager.submit(DEAD_URL, JobParams::default()).unwrap_err();
        assert_eq!(err, QueueError::QueueFull { capacity: 100 });
        assert_eq!(manager.list().len(), 100);
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_submit_multiple_partial_admission() {
        let manager = manager(2);
        manager.insert_restored(restored(&manager, "paused01", JobStatus::Paused, None));

        let err = manager
            .submit_multiple(&format!("{DEAD_URL}\n\n  {DEAD_URL}  \n"), &JobParams::default())
            .unwrap_err();
        assert_eq!(err.admitted.len(), 1);
        assert_eq!(err.error, QueueError::QueueFull { capacity: 2 });

        let err = manager.submit_multiple(DEAD_URL, &JobParams::default()).unwrap_err();
        assert!(err.admitted.is_empty());

        let err = manager.submit_multiple("\n  \n", &JobParams::default()).unwrap_err();
        assert_eq!(err.error, QueueError::UrlRequired);
    }

    #[tokio::test]
    async fn test_control_preconditions() {
        let manager = manager(10);
        manager.insert_restored(restored(&manager, "done0001", JobStatus::Completed, None));
        manager.insert_restored(restored(&manager, "paused01", JobStatus::Paused, None));

        assert_eq!(manager.cancel("missing"), Err(QueueError::NotFound("missing".into())));
        assert_eq!(manager.cancel("done0001"), Err(QueueError::AlreadyFinished("done0001".into())));
        assert_eq!(manager.pause("done0001"), Err(QueueError::NotPausable("done0001".into())));
        assert_eq!(manager.resume("done0001"), Err(QueueError::NotPaused("done0001".into())));
        assert_eq!(manager.retry("done0001"), Err(QueueError::NotRetryable("done0001".into())));
        assert_eq!(manager.retry("paused01"), Err(QueueError::NotRetryable("paused01".into())));

        manager.cancel("paused01").unwrap();
        let view = manager.get("paused01").unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.error, CANCELLED_SENTINEL);
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let manager = manager(10);
        manager.insert_restored(restored(&manager, "old00001", JobStatus::Completed, Some(chrono::Duration::hours(2))));
        manager.insert_restored(restored(&manager, "new00001", JobStatus::Completed, Some(chrono::Duration::zero())));
        manager.insert_restored(restored(&manager, "failed01", JobStatus::Failed, Some(chrono::Duration::hours(3))));
        let mut sub = manager.subscribe();

        let evicted = manager.sweep_now();
        assert_eq!(evicted, vec!["old00001".to_string(), "failed01".to_string()]);
        assert_eq!(
            drain(&mut sub),
            vec![
                (EventKind::Removed, "old00001".to_string()),
                (EventKind::Removed, "failed01".to_string())
            ]
        );
        assert!(manager.get("new00001").is_some());

        // Idempotent without intervening changes.
        assert!(manager.sweep_now().is_empty());
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_retention_sweep_evicts_stale_paused() {
        let manager = manager(10);
        let bus = manager.inner.bus.clone();
        let old = Utc::now() - chrono::Duration::hours(25);
        manager.insert_restored(Job::restored("paused01", JobStatus::Paused, old, None, bus.clone()));
        manager.insert_restored(Job::restored("paused02", JobStatus::Paused, Utc::now(), None, bus));

        assert_eq!(manager.sweep_now(), vec!["paused01".to_string()]);
        assert!(manager.get("paused02").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work_and_ends_subscriptions() {
        let manager = manager(10);
        let mut sub = manager.subscribe();
        manager.shutdown().await;
        assert!(manager.is_shutting_down());
        assert_eq!(manager.submit(DEAD_URL, JobParams::default()), Err(QueueError::ShuttingDown));
        assert!(sub.recv().await.is_none());
    }
}
