pub mod config;
pub mod job;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rocket::tokio;
use rocket::tokio::task::JoinHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::email::{Transport, TransportError};
use crate::store::{JobStore, QueueStats, StoreError};

use self::config::QueueConfig;
use self::job::{JobId, JobStatus, NotificationJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error(transparent)]
    StoreUnavailable(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::StoreUnavailable(e)
    }
}

/// What one cycle did. Never an error: faults end up here or in job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was still running.
    Skipped,
    /// The due-job query failed; nothing was attempted.
    Aborted(StoreError),
    Completed(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub due: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub persist_errors: usize,
    pub swept: u64,
}

/// A durable, at-least-once notification queue.
///
/// Handlers call [`submit`](Self::submit); a single worker started with
/// [`start`](Self::start) delivers due jobs every `poll_interval` and applies
/// the retry schedule. The payload type `P` is stored as JSON and decoded
/// again before each delivery attempt.
pub struct NotificationQueue<P> {
    engine: Arc<Engine<P>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Engine<P> {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn Transport<P>>,
    cycle_running: AtomicBool,
    _payload: PhantomData<fn() -> P>,
}

/// Holds the "cycle in progress" flag; released on drop, including unwinds.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P> NotificationQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport<P>>,
    ) -> Self {
        NotificationQueue {
            engine: Arc::new(Engine {
                config,
                store,
                transport,
                cycle_running: AtomicBool::new(false),
                _payload: PhantomData,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.engine.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.engine.config
    }

    // ── Enqueue ─────────────────────────────────────────────────────

    /// Persist a new pending job, due immediately. No retry on store failure.
    pub fn submit(&self, recipient: &str, payload: &P) -> Result<JobId, QueueError> {
        self.submit_at(recipient, payload, Utc::now())
    }

    pub fn submit_at(
        &self,
        recipient: &str,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(QueueError::InvalidJob("recipient is required".into()));
        }
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::InvalidJob(format!("payload: {}", e)))?;
        if payload.is_null() {
            return Err(QueueError::InvalidJob("payload is required".into()));
        }

        let job = NotificationJob::new(recipient, payload, now);
        if let Err(e) = self.engine.store.insert(&job) {
            log::error!(
                "[queue:{}] Failed to enqueue notification to {}: {}",
                self.name(),
                recipient,
                e
            );
            return Err(e.into());
        }
        log::debug!("[queue:{}] Enqueued job {} for {}", self.name(), job.id, recipient);
        Ok(job.id)
    }

    // ── Cycle ───────────────────────────────────────────────────────

    pub fn run_cycle(&self) -> CycleOutcome {
        self.engine.run_cycle_at(Utc::now())
    }

    pub fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        self.engine.run_cycle_at(now)
    }

    pub fn is_cycle_running(&self) -> bool {
        self.engine.cycle_running.load(Ordering::Acquire)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the timer task: one cycle immediately, then every `poll_interval`.
    /// Must be called from within the Tokio runtime. No-op if already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let engine = Arc::clone(&self.engine);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Cycles run detached; an overlapping tick hits the guard and is skipped.
                let engine = Arc::clone(&engine);
                tokio::task::spawn_blocking(move || {
                    engine.run_cycle_at(Utc::now());
                });
            }
        }));
        log::info!(
            "[queue:{}] Worker started (every {}s, {} retries)",
            self.name(),
            self.engine.config.poll_interval.as_secs(),
            self.engine.config.max_retries()
        );
    }

    /// Stop scheduling new cycles. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            log::info!("[queue:{}] Worker stopped", self.name());
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        self.engine.store.stats()
    }

    pub fn failed_jobs(&self, limit: i64) -> Result<Vec<NotificationJob>, StoreError> {
        self.engine.store.list_by_status(JobStatus::Failed, limit)
    }

    pub fn job(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError> {
        self.engine.store.get(id)
    }
}

impl<P> Engine<P>
where
    P: DeserializeOwned,
{
    fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let name = &self.config.name;
        let Some(_guard) = CycleGuard::acquire(&self.cycle_running) else {
            log::debug!("[queue:{}] Previous cycle still running, skipping tick", name);
            return CycleOutcome::Skipped;
        };

        let due = match self.store.find_due(now) {
            Ok(jobs) => jobs,
            Err(e) => {
                log::warn!("[queue:{}] Skipping cycle: {}", name, e);
                return CycleOutcome::Aborted(e);
            }
        };

        let mut report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };
        for job in due {
            self.process(job, now, &mut report);
        }

        match self
            .store
            .delete_completed_before(self.config.retention_cutoff(now))
        {
            Ok(count) => report.swept = count,
            Err(e) => log::warn!("[queue:{}] Retention sweep failed: {}", name, e),
        }

        if report.due > 0 || report.swept > 0 {
            log::info!(
                "[queue:{}] Cycle: {} due, {} delivered, {} retrying, {} failed, {} swept",
                name,
                report.due,
                report.delivered,
                report.retried,
                report.failed,
                report.swept
            );
        }
        CycleOutcome::Completed(report)
    }

    /// Attempt one job and persist the resulting state.
    fn process(&self, mut job: NotificationJob, now: DateTime<Utc>, report: &mut CycleReport) {
        let name = &self.config.name;
        if job.status.is_terminal() {
            return;
        }

        match self.deliver(&job) {
            Ok(()) => {
                job.status = JobStatus::Completed;
                report.delivered += 1;
                log::info!("[queue:{}] Sent job {} to {}", name, job.id, job.recipient);
            }
            Err(e) => match self.config.retry_delay(job.attempts) {
                Some(delay) => {
                    job.attempts += 1;
                    job.next_attempt_at = config::after(now, delay);
                    report.retried += 1;
                    log::warn!(
                        "[queue:{}] Job {} to {} failed (attempt {}), retry at {}: {}",
                        name,
                        job.id,
                        job.recipient,
                        job.attempts,
                        job.next_attempt_at.format("%Y-%m-%d %H:%M:%S"),
                        e
                    );
                }
                None => {
                    job.status = JobStatus::Failed;
                    report.failed += 1;
                    log::error!(
                        "[queue:{}] Job {} to {} permanently failed after {} retries: {}",
                        name,
                        job.id,
                        job.recipient,
                        job.attempts,
                        e
                    );
                }
            },
        }

        if let Err(e) = self.store.update(&job) {
            report.persist_errors += 1;
            log::error!("[queue:{}] Failed to persist job {}: {}", name, job.id, e);
        }
    }

    fn deliver(&self, job: &NotificationJob) -> Result<(), TransportError> {
        let payload: P = serde_json::from_value(job.payload.clone())
            .map_err(|e| TransportError::Payload(e.to_string()))?;
        self.transport.send(&job.recipient, &payload)
    }
}
