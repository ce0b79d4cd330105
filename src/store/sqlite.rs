use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::DbPool;
use crate::queue::job::{JobId, JobStatus, NotificationJob};

use super::{table_name, JobStore, QueueStats, StoreError};

/// SQLite-backed job table. One table per queue, timestamps stored as
/// unix milliseconds so `<=`/`<` comparisons are numeric.
pub struct SqliteJobStore {
    pool: DbPool,
    table: String,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool, queue: &str) -> Self {
        Self {
            pool,
            table: table_name(queue),
        }
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT id, recipient, payload, attempts, next_attempt_at, status, created_at FROM {}",
            self.table
        )
    }

    fn query_jobs(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<NotificationJob>, StoreError> {
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        let mut stmt = conn.prepare(sql).map_err(StoreError::unavailable)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)
            .map_err(StoreError::unavailable)?;

        let mut jobs = Vec::new();
        for row in rows {
            let raw = row.map_err(StoreError::unavailable)?;
            match raw.into_job() {
                Ok(job) => jobs.push(job),
                Err(e) => log::warn!("[store] {}: skipping row: {}", self.table, e),
            }
        }
        Ok(jobs)
    }
}

/// Column values as read, before decoding.
struct RawRow {
    id: String,
    recipient: String,
    payload: String,
    attempts: i64,
    next_attempt_at: i64,
    status: String,
    created_at: i64,
}

impl RawRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: r.get(0)?,
            recipient: r.get(1)?,
            payload: r.get(2)?,
            attempts: r.get(3)?,
            next_attempt_at: r.get(4)?,
            status: r.get(5)?,
            created_at: r.get(6)?,
        })
    }

    fn into_job(self) -> Result<NotificationJob, StoreError> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::malformed(format!("job {}: payload: {}", self.id, e)))?;
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::malformed(format!("job {}: {}", self.id, e)))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::malformed(format!("job {}: negative attempts", self.id)))?;
        Ok(NotificationJob {
            next_attempt_at: from_millis(&self.id, self.next_attempt_at)?,
            created_at: from_millis(&self.id, self.created_at)?,
            id: JobId::from(self.id),
            recipient: self.recipient,
            payload,
            attempts,
            status,
        })
    }
}

fn from_millis(id: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::malformed(format!("job {}: timestamp {} out of range", id, ms)))
}

impl JobStore for SqliteJobStore {
    // ── Lifecycle ───────────────────────────────────────────────────

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_due ON {t}(status, next_attempt_at);
            CREATE INDEX IF NOT EXISTS idx_{t}_created ON {t}(status, created_at);
            ",
            t = self.table
        ))
        .map_err(StoreError::unavailable)
    }

    // ── Queue operations ────────────────────────────────────────────

    fn insert(&self, job: &NotificationJob) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&job.payload).map_err(StoreError::malformed)?;
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, recipient, payload, attempts, next_attempt_at, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.table
            ),
            params![
                job.id.as_str(),
                job.recipient,
                payload,
                job.attempts,
                job.next_attempt_at.timestamp_millis(),
                job.status.as_str(),
                job.created_at.timestamp_millis(),
            ],
        )
        .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>, StoreError> {
        let sql = format!(
            "{} WHERE status = 'pending' AND next_attempt_at <= ?1",
            self.select_columns()
        );
        self.query_jobs(&sql, &[&now.timestamp_millis()])
    }

    fn update(&self, job: &NotificationJob) -> Result<(), StoreError> {
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        conn.execute(
            &format!(
                "UPDATE {} SET attempts = ?1, next_attempt_at = ?2, status = ?3 \
                 WHERE id = ?4 AND status = 'pending'",
                self.table
            ),
            params![
                job.attempts,
                job.next_attempt_at.timestamp_millis(),
                job.status.as_str(),
                job.id.as_str(),
            ],
        )
        .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        let count = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE status = 'completed' AND created_at < ?1",
                    self.table
                ),
                params![cutoff.timestamp_millis()],
            )
            .map_err(StoreError::unavailable)?;
        Ok(count as u64)
    }

    // ── Inspection ──────────────────────────────────────────────────

    fn get(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError> {
        let sql = format!("{} WHERE id = ?1", self.select_columns());
        Ok(self.query_jobs(&sql, &[&id.as_str()])?.into_iter().next())
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        let sql = format!(
            "{} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            self.select_columns()
        );
        self.query_jobs(&sql, &[&status.as_str(), &limit])
    }

    fn stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.pool.get().map_err(StoreError::unavailable)?;
        conn.query_row(
            &format!(
                "SELECT \
                    COALESCE(SUM(CASE WHEN status='pending' THEN 1 ELSE 0 END),0), \
                    COALESCE(SUM(CASE WHEN status='completed' THEN 1 ELSE 0 END),0), \
                    COALESCE(SUM(CASE WHEN status='failed' THEN 1 ELSE 0 END),0), \
                    COUNT(*) \
                 FROM {}",
                self.table
            ),
            [],
            |r| {
                Ok(QueueStats {
                    pending: r.get::<_, i64>(0)? as u64,
                    completed: r.get::<_, i64>(1)? as u64,
                    failed: r.get::<_, i64>(2)? as u64,
                    total: r.get::<_, i64>(3)? as u64,
                })
            },
        )
        .map_err(StoreError::unavailable)
    }
}
