#![cfg(test)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::email::{Transport, TransportError};
use crate::notify::{RecruitmentEmail, WelcomeEmail};
use crate::queue::config::QueueConfig;
use crate::queue::job::{JobId, JobStatus, NotificationJob};
use crate::queue::{CycleOutcome, CycleReport, NotificationQueue, QueueError};
use crate::store::sqlite::SqliteJobStore;
use crate::store::{JobStore, QueueStats, StoreError};

/// Atomic counter for unique shared-cache DB names so parallel tests don't collide.
static TEST_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh shared-cache in-memory SQLite pool, so the cycle thread and the test
/// thread see the same data through different connections.
fn test_pool() -> crate::db::DbPool {
    let id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let uri = format!("file:notifier_test_{}?mode=memory&cache=shared", id);
    let manager = SqliteConnectionManager::file(uri);
    Pool::builder()
        .max_size(4)
        .build(manager)
        .expect("Failed to create test pool")
}

fn test_store(queue: &str) -> Arc<SqliteJobStore> {
    let store = SqliteJobStore::new(test_pool(), queue);
    store.migrate().expect("Failed to migrate");
    Arc::new(store)
}

/// `retryDelays = [10s, 30s, 60s]`
fn scenario_config() -> QueueConfig {
    QueueConfig::new(
        "scenario",
        Duration::from_secs(60),
        vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ],
        Duration::from_secs(24 * 60 * 60),
    )
    .unwrap()
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(r) => r,
        other => panic!("expected completed cycle, got {:?}", other),
    }
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn welcome(name: &str) -> WelcomeEmail {
    WelcomeEmail {
        name: name.to_string(),
        token: format!("tok-{}", name),
        member_id: format!("SNSF-{}", name.len()),
    }
}

// ═══════════════════════════════════════════════════════════
// Test transports
// ═══════════════════════════════════════════════════════════

/// Fails the first `failures` calls, then succeeds.
struct FailFirst {
    failures: usize,
    calls: AtomicUsize,
}

impl FailFirst {
    fn new(failures: usize) -> Self {
        FailFirst {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<P: Sync> Transport<P> for FailFirst {
    fn send(&self, _recipient: &str, _payload: &P) -> Result<(), TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(TransportError::Provider {
                provider: "test".to_string(),
                message: format!("failure #{}", n + 1),
            })
        } else {
            Ok(())
        }
    }
}

/// Always fails for the listed recipients, succeeds for everyone else.
struct RejectRecipients {
    rejected: HashSet<String>,
    sent: Mutex<Vec<String>>,
}

impl RejectRecipients {
    fn new(rejected: &[&str]) -> Self {
        RejectRecipients {
            rejected: rejected.iter().map(|s| s.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl<P: Sync> Transport<P> for RejectRecipients {
    fn send(&self, recipient: &str, _payload: &P) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(recipient.to_string());
        if self.rejected.contains(recipient) {
            Err(TransportError::Provider {
                provider: "test".to_string(),
                message: "mailbox unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Blocks inside `send` until released, so a cycle can be held open.
struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    calls: AtomicUsize,
}

impl<P: Sync> Transport<P> for Gate {
    fn send(&self, _recipient: &str, _payload: &P) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Test stores
// ═══════════════════════════════════════════════════════════

/// Wraps a real store and can be switched "offline".
struct Switchable {
    inner: Arc<SqliteJobStore>,
    down: AtomicBool,
}

impl Switchable {
    fn new(inner: Arc<SqliteJobStore>) -> Self {
        Switchable {
            inner,
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("database not connected".to_string()))
        } else {
            Ok(())
        }
    }
}

impl JobStore for Switchable {
    fn migrate(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.migrate()
    }
    fn insert(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert(job)
    }
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>, StoreError> {
        self.check()?;
        self.inner.find_due(now)
    }
    fn update(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update(job)
    }
    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.delete_completed_before(cutoff)
    }
    fn get(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError> {
        self.check()?;
        self.inner.get(id)
    }
    fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        self.check()?;
        self.inner.list_by_status(status, limit)
    }
    fn stats(&self) -> Result<QueueStats, StoreError> {
        self.check()?;
        self.inner.stats()
    }
}

/// Fails `update` for one recipient only.
struct RejectUpdatesFor {
    inner: Arc<SqliteJobStore>,
    recipient: String,
}

impl JobStore for RejectUpdatesFor {
    fn migrate(&self) -> Result<(), StoreError> {
        self.inner.migrate()
    }
    fn insert(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.inner.insert(job)
    }
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>, StoreError> {
        self.inner.find_due(now)
    }
    fn update(&self, job: &NotificationJob) -> Result<(), StoreError> {
        if job.recipient == self.recipient {
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }
        self.inner.update(job)
    }
    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.delete_completed_before(cutoff)
    }
    fn get(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError> {
        self.inner.get(id)
    }
    fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        self.inner.list_by_status(status, limit)
    }
    fn stats(&self) -> Result<QueueStats, StoreError> {
        self.inner.stats()
    }
}

// ═══════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════

#[test]
fn scenario_a_single_cycle_success() {
    let store = test_store("welcome");
    let transport = Arc::new(FailFirst::new(0));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport.clone());
    let t0 = Utc::now();

    let id = q.submit_at("a@x.com", &welcome("Asha"), t0).unwrap();
    let r = completed(q.run_cycle_at(t0));
    assert_eq!(r.delivered, 1);

    let job = store.get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);
    assert_eq!(transport.calls(), 1);
}

#[test]
fn scenario_b_two_failures_then_success() {
    let store = test_store("recruitment");
    let transport = Arc::new(FailFirst::new(2));
    let q: NotificationQueue<RecruitmentEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport.clone());
    let t0 = Utc::now();
    let payload = RecruitmentEmail::application_received("Ravi", "Core Team", None);
    let id = q.submit_at("ravi@x.com", &payload, t0).unwrap();

    completed(q.run_cycle_at(t0));
    let job = store.get(&id).unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Pending, 1));
    assert_eq!(job.next_attempt_at.timestamp_millis(), (t0 + secs(10)).timestamp_millis());

    let t1 = t0 + secs(10);
    completed(q.run_cycle_at(t1));
    let job = store.get(&id).unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Pending, 2));
    assert_eq!(job.next_attempt_at.timestamp_millis(), (t1 + secs(30)).timestamp_millis());

    // not yet due
    let r = completed(q.run_cycle_at(t1 + secs(29)));
    assert_eq!(r.due, 0);

    let t2 = t1 + secs(30);
    completed(q.run_cycle_at(t2));
    let job = store.get(&id).unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Completed, 2));
    assert_eq!(transport.calls(), 3);
}

#[test]
fn scenario_c_exhausted_retries_fail_permanently() {
    let store = test_store("welcome");
    let transport = Arc::new(FailFirst::new(usize::MAX));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport.clone());
    let mut now = Utc::now();
    let id = q.submit_at("bad@x.com", &welcome("Bad"), now).unwrap();

    let mut seen_attempts = vec![];
    for _ in 0..4 {
        completed(q.run_cycle_at(now));
        let job = store.get(&id).unwrap().unwrap();
        seen_attempts.push(job.attempts);
        now = job.next_attempt_at + secs(1);
    }
    assert_eq!(seen_attempts, vec![1, 2, 3, 3]);

    let job = store.get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(transport.calls(), 4);

    // a fifth cycle makes no further attempt
    let r = completed(q.run_cycle_at(now + chrono::Duration::days(2)));
    assert_eq!(r.due, 0);
    assert_eq!(transport.calls(), 4);
    assert_eq!(store.get(&id).unwrap().unwrap(), job);
}

#[test]
fn scenario_d_failures_are_isolated_per_job() {
    let store = test_store("welcome");
    let transport = Arc::new(RejectRecipients::new(&["bad@x.com"]));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport.clone());
    let t0 = Utc::now();
    let bad = q.submit_at("bad@x.com", &welcome("Bad"), t0).unwrap();
    let good = q.submit_at("good@x.com", &welcome("Good"), t0).unwrap();

    let r = completed(q.run_cycle_at(t0));
    assert_eq!(r.due, 2);
    assert_eq!(r.delivered, 1);
    assert_eq!(r.retried, 1);

    assert_eq!(store.get(&good).unwrap().unwrap().status, JobStatus::Completed);
    let bad = store.get(&bad).unwrap().unwrap();
    assert_eq!((bad.status, bad.attempts), (JobStatus::Pending, 1));
    assert_eq!(transport.sent.lock().unwrap().len(), 2);
}

#[test]
fn scenario_e_overlapping_tick_is_a_no_op() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Arc::new(Gate {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
        calls: AtomicUsize::new(0),
    });
    let store = test_store("welcome");
    let q: Arc<NotificationQueue<WelcomeEmail>> = Arc::new(NotificationQueue::new(
        scenario_config(),
        store.clone(),
        transport.clone(),
    ));
    let t0 = Utc::now();
    let id = q.submit_at("a@x.com", &welcome("Asha"), t0).unwrap();

    let first = {
        let q = Arc::clone(&q);
        std::thread::spawn(move || q.run_cycle_at(t0))
    };
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first cycle never reached the transport");

    assert!(q.is_cycle_running());
    assert_eq!(q.run_cycle_at(t0), CycleOutcome::Skipped);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    let r = completed(first.join().unwrap());
    assert_eq!(r.delivered, 1);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(&id).unwrap().unwrap().status, JobStatus::Completed);
    assert!(!q.is_cycle_running());
}

// ═══════════════════════════════════════════════════════════
// Store outages
// ═══════════════════════════════════════════════════════════

#[test]
fn submit_reports_store_unavailable() {
    let store = Arc::new(Switchable::new(test_store("welcome")));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), Arc::new(FailFirst::new(0)));
    store.set_down(true);
    match q.submit("a@x.com", &welcome("Asha")) {
        Err(QueueError::StoreUnavailable(StoreError::Unavailable(_))) => {}
        other => panic!("unexpected: {:?}", other),
    }
    store.set_down(false);
    assert_eq!(store.stats().unwrap().total, 0);
}

#[test]
fn cycle_aborts_silently_when_store_is_down() {
    let store = Arc::new(Switchable::new(test_store("welcome")));
    let transport = Arc::new(FailFirst::new(0));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport.clone());
    let t0 = Utc::now();
    let id = q.submit_at("a@x.com", &welcome("Asha"), t0).unwrap();

    store.set_down(true);
    assert!(matches!(q.run_cycle_at(t0), CycleOutcome::Aborted(_)));
    assert_eq!(transport.calls(), 0);
    assert!(!q.is_cycle_running());

    // next tick picks it up
    store.set_down(false);
    completed(q.run_cycle_at(t0 + secs(60)));
    assert_eq!(store.get(&id).unwrap().unwrap().status, JobStatus::Completed);
}

#[test]
fn persist_failure_does_not_stop_the_cycle() {
    let inner = test_store("welcome");
    let store = Arc::new(RejectUpdatesFor {
        inner: inner.clone(),
        recipient: "stuck@x.com".to_string(),
    });
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store, Arc::new(FailFirst::new(0)));
    let t0 = Utc::now();
    let stuck = q.submit_at("stuck@x.com", &welcome("Stuck"), t0).unwrap();
    let fine = q.submit_at("fine@x.com", &welcome("Fine"), t0).unwrap();

    let r = completed(q.run_cycle_at(t0));
    assert_eq!(r.delivered, 2);
    assert_eq!(r.persist_errors, 1);
    assert_eq!(inner.get(&fine).unwrap().unwrap().status, JobStatus::Completed);
    // left pending at its last persisted state: at-least-once
    assert_eq!(inner.get(&stuck).unwrap().unwrap().status, JobStatus::Pending);
}

// ═══════════════════════════════════════════════════════════
// Retention
// ═══════════════════════════════════════════════════════════

#[test]
fn retention_sweeps_old_completed_but_keeps_failed() {
    let store = test_store("welcome");
    let transport = Arc::new(RejectRecipients::new(&["dead@x.com"]));
    let q: NotificationQueue<WelcomeEmail> =
        NotificationQueue::new(scenario_config(), store.clone(), transport);
    let t0 = Utc::now() - chrono::Duration::days(3);
    let done = q.submit_at("ok@x.com", &welcome("Ok"), t0).unwrap();
    let dead = q.submit_at("dead@x.com", &welcome("Dead"), t0).unwrap();

    let mut now = t0;
    for _ in 0..4 {
        completed(q.run_cycle_at(now));
        now += chrono::Duration::minutes(2);
    }
    assert_eq!(store.get(&dead).unwrap().unwrap().status, JobStatus::Failed);
    // still inside the window: nothing swept yet
    assert!(store.get(&done).unwrap().is_some());

    let r = completed(q.run_cycle_at(t0 + chrono::Duration::hours(24) + secs(1)));
    assert_eq!(r.swept, 1);
    assert!(store.get(&done).unwrap().is_none());

    let r = completed(q.run_cycle_at(t0 + chrono::Duration::days(365)));
    assert_eq!(r.swept, 0);
    assert_eq!(store.get(&dead).unwrap().unwrap().status, JobStatus::Failed);
}

// ═══════════════════════════════════════════════════════════
// Invariants
// ═══════════════════════════════════════════════════════════

#[test]
fn attempts_are_monotonic_and_bounded() {
    let config = scenario_config();
    let max = config.max_retries();
    for failures in 0..=5usize {
        let store = test_store("welcome");
        let transport = Arc::new(FailFirst::new(failures));
        let q: NotificationQueue<WelcomeEmail> =
            NotificationQueue::new(config.clone(), store.clone(), transport.clone());
        let mut now = Utc::now();
        let id = q.submit_at("a@x.com", &welcome("A"), now).unwrap();

        let mut last = 0;
        for _ in 0..8 {
            completed(q.run_cycle_at(now));
            let job = store.get(&id).unwrap().unwrap();
            assert!(job.attempts >= last, "attempts went backwards");
            assert!(job.attempts <= max, "attempts exceeded schedule");
            last = job.attempts;
            now += chrono::Duration::minutes(5);
        }

        let job = store.get(&id).unwrap().unwrap();
        if failures <= max as usize {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempts as usize, failures);
            assert_eq!(transport.calls(), failures + 1);
        } else {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempts, max);
            assert_eq!(transport.calls(), max as usize + 1);
        }
    }
}

#[test]
fn stats_track_every_state() {
    let store = test_store("recruitment");
    let transport = Arc::new(RejectRecipients::new(&["no@x.com"]));
    let q: NotificationQueue<RecruitmentEmail> =
        NotificationQueue::new(scenario_config(), store, transport);
    let t0 = Utc::now();
    let payload = RecruitmentEmail::application_received("A", "Team", None);
    q.submit_at("yes@x.com", &payload, t0).unwrap();
    q.submit_at("no@x.com", &payload, t0).unwrap();
    q.submit_at("later@x.com", &payload, t0 + chrono::Duration::hours(1))
        .unwrap();

    completed(q.run_cycle_at(t0));
    assert_eq!(
        q.stats().unwrap(),
        QueueStats {
            pending: 2,
            completed: 1,
            failed: 0,
            total: 3
        }
    );
}
