use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use std::sync::Arc;

use crate::notify::Notifier;
use crate::queue::NotificationQueue;
use crate::store::QueueStats;

// ── Data Structures ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct QueuesHealth {
    pub backend: String,
    pub welcome: QueueHealth,
    pub recruitment: QueueHealth,
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub name: String,
    pub running: bool,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub stats: Option<QueueStats>,
    /// Set when the store could not be read.
    pub error: Option<String>,
}

/// Name of the storage backend, shared via managed state.
pub struct BackendName(pub &'static str);

// ── Gather Functions ────────────────────────────────────────

pub fn gather_queue<P>(queue: &NotificationQueue<P>) -> QueueHealth
where
    P: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let (stats, error) = match queue.stats() {
        Ok(s) => (Some(s), None),
        Err(e) => (None, Some(e.to_string())),
    };
    QueueHealth {
        name: queue.name().to_string(),
        running: queue.is_running(),
        poll_interval_secs: queue.config().poll_interval.as_secs(),
        max_retries: queue.config().max_retries(),
        stats,
        error,
    }
}

pub fn gather(notifier: &Notifier, backend: &str) -> QueuesHealth {
    QueuesHealth {
        backend: backend.to_string(),
        welcome: gather_queue(&notifier.welcome),
        recruitment: gather_queue(&notifier.recruitment),
    }
}

// ── Routes ──────────────────────────────────────────────────

#[get("/health/queues")]
pub fn queues(notifier: &State<Arc<Notifier>>, backend: &State<BackendName>) -> Json<QueuesHealth> {
    Json(gather(notifier.inner(), backend.0))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![queues]
}
