use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::job::{JobId, JobStatus, NotificationJob};

pub mod mongo;
pub mod sqlite;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored record could not be decoded into a job.
    #[error("malformed job record: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn unavailable(e: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(e.to_string())
    }

    pub fn malformed(e: impl std::fmt::Display) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

/// Per-status job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Durable job table for a single queue. Pure data access, no policy.
/// Implementations: `SqliteJobStore` (rusqlite/r2d2) and `MongoJobStore` (mongodb).
pub trait JobStore: Send + Sync {
    // ── Lifecycle ───────────────────────────────────────────────────
    /// Create the table/collection and its indexes if missing.
    fn migrate(&self) -> Result<(), StoreError>;

    // ── Queue operations ────────────────────────────────────────────
    fn insert(&self, job: &NotificationJob) -> Result<(), StoreError>;

    /// Pending jobs whose `next_attempt_at <= now`, in the backend's natural order.
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>, StoreError>;

    /// Persist `attempts`, `next_attempt_at` and `status` of a job.
    /// Rows that are already terminal are left untouched.
    fn update(&self, job: &NotificationJob) -> Result<(), StoreError>;

    /// Delete completed jobs created before `cutoff`. Returns the number removed.
    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Inspection ──────────────────────────────────────────────────
    fn get(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError>;
    fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<NotificationJob>, StoreError>;
    fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// A connected storage backend, handing out one job store per queue.
pub enum Backend {
    Sqlite(crate::db::DbPool),
    Mongo(mongodb::sync::Database),
}

impl Backend {
    /// Open the backend selected by `[database] backend`.
    pub fn connect(config: &crate::config::DatabaseConfig) -> Result<Self, StoreError> {
        match config.backend.as_str() {
            "mongodb" => mongo::MongoJobStore::connect(&config.uri, &config.name).map(Backend::Mongo),
            _ => crate::db::init_pool_at(&config.path)
                .map(Backend::Sqlite)
                .map_err(StoreError::Unavailable),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sqlite(_) => "sqlite",
            Backend::Mongo(_) => "mongodb",
        }
    }

    /// The migrated job store for `queue`.
    pub fn store_for(&self, queue: &str) -> Result<Arc<dyn JobStore>, StoreError> {
        let store: Arc<dyn JobStore> = match self {
            Backend::Sqlite(pool) => {
                Arc::new(sqlite::SqliteJobStore::new(pool.clone(), queue))
            }
            Backend::Mongo(db) => Arc::new(mongo::MongoJobStore::new(db, queue)),
        };
        store.migrate()?;
        Ok(store)
    }
}

/// Table/collection name for a queue: `<name>_jobs`, restricted to `[a-z0-9_]`.
pub fn table_name(queue: &str) -> String {
    let cleaned: String = queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_jobs", cleaned)
}
