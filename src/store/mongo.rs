use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;

use crate::queue::job::{JobId, JobStatus, NotificationJob};

use super::{table_name, JobStore, QueueStats, StoreError};

/// MongoDB-backed job collection. One collection per queue.
pub struct MongoJobStore {
    coll: Collection<Document>,
}

impl MongoJobStore {
    /// Connect to `uri` and ping the server so a dead database fails at startup.
    pub fn connect(uri: &str, db_name: &str) -> Result<Database, StoreError> {
        let client_options = ClientOptions::parse(uri).map_err(StoreError::unavailable)?;
        let client = Client::with_options(client_options).map_err(StoreError::unavailable)?;
        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 }, None)
            .map_err(|e| StoreError::unavailable(format!("MongoDB ping failed: {}", e)))?;
        Ok(db)
    }

    /// Bind to the queue's collection in an already connected database.
    pub fn new(db: &Database, queue: &str) -> Self {
        Self {
            coll: db.collection::<Document>(&table_name(queue)),
        }
    }

    fn find_jobs(
        &self,
        filter: Document,
        opts: Option<FindOptions>,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        let cursor = self
            .coll
            .find(filter, opts)
            .map_err(StoreError::unavailable)?;
        let mut jobs = Vec::new();
        for d in cursor {
            let d = d.map_err(StoreError::unavailable)?;
            match doc_to_job(&d) {
                Ok(job) => jobs.push(job),
                Err(e) => log::warn!("[store] {}: skipping document: {}", self.coll.name(), e),
            }
        }
        Ok(jobs)
    }

    fn count(&self, filter: Document) -> Result<u64, StoreError> {
        self.coll
            .count_documents(filter, None)
            .map_err(StoreError::unavailable)
    }
}

impl JobStore for MongoJobStore {
    // ── Lifecycle ───────────────────────────────────────────────────

    fn migrate(&self) -> Result<(), StoreError> {
        self.coll
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "next_attempt_at": 1 })
                    .build(),
                None,
            )
            .map_err(StoreError::unavailable)?;
        self.coll
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "created_at": 1 })
                    .options(IndexOptions::builder().name("status_created".to_string()).build())
                    .build(),
                None,
            )
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    // ── Queue operations ────────────────────────────────────────────

    fn insert(&self, job: &NotificationJob) -> Result<(), StoreError> {
        let payload = mongodb::bson::to_bson(&job.payload).map_err(StoreError::malformed)?;
        self.coll
            .insert_one(
                doc! {
                    "_id": job.id.as_str(),
                    "recipient": job.recipient.as_str(),
                    "payload": payload,
                    "attempts": job.attempts as i64,
                    "next_attempt_at": to_bson_time(job.next_attempt_at),
                    "status": job.status.as_str(),
                    "created_at": to_bson_time(job.created_at),
                },
                None,
            )
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>, StoreError> {
        self.find_jobs(
            doc! {
                "status": JobStatus::Pending.as_str(),
                "next_attempt_at": { "$lte": to_bson_time(now) },
            },
            None,
        )
    }

    fn update(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.coll
            .update_one(
                doc! { "_id": job.id.as_str(), "status": JobStatus::Pending.as_str() },
                doc! { "$set": {
                    "attempts": job.attempts as i64,
                    "next_attempt_at": to_bson_time(job.next_attempt_at),
                    "status": job.status.as_str(),
                } },
                None,
            )
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .coll
            .delete_many(
                doc! {
                    "status": JobStatus::Completed.as_str(),
                    "created_at": { "$lt": to_bson_time(cutoff) },
                },
                None,
            )
            .map_err(StoreError::unavailable)?;
        Ok(result.deleted_count)
    }

    // ── Inspection ──────────────────────────────────────────────────

    fn get(&self, id: &JobId) -> Result<Option<NotificationJob>, StoreError> {
        let found = self
            .coll
            .find_one(doc! { "_id": id.as_str() }, None)
            .map_err(StoreError::unavailable)?;
        match found {
            Some(d) => doc_to_job(&d).map(Some),
            None => Ok(None),
        }
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        let opts = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(Some(limit))
            .build();
        self.find_jobs(doc! { "status": status.as_str() }, Some(opts))
    }

    fn stats(&self) -> Result<QueueStats, StoreError> {
        Ok(QueueStats {
            pending: self.count(doc! { "status": JobStatus::Pending.as_str() })?,
            completed: self.count(doc! { "status": JobStatus::Completed.as_str() })?,
            failed: self.count(doc! { "status": JobStatus::Failed.as_str() })?,
            total: self.count(doc! {})?,
        })
    }
}

fn to_bson_time(t: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(t.timestamp_millis())
}

fn from_bson_time(d: &Document, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let ms = d
        .get_datetime(key)
        .map_err(|e| StoreError::malformed(format!("{}: {}", key, e)))?
        .timestamp_millis();
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::malformed(format!("{}: timestamp {} out of range", key, ms)))
}

// ── Helper: Convert BSON Document to NotificationJob ────────────────

fn doc_to_job(d: &Document) -> Result<NotificationJob, StoreError> {
    let id = d
        .get_str("_id")
        .map_err(|e| StoreError::malformed(format!("_id: {}", e)))?
        .to_string();
    let recipient = d
        .get_str("recipient")
        .map_err(|e| StoreError::malformed(format!("job {}: recipient: {}", id, e)))?
        .to_string();
    let payload = d
        .get("payload")
        .cloned()
        .map(Bson::into_relaxed_extjson)
        .ok_or_else(|| StoreError::malformed(format!("job {}: missing payload", id)))?;
    let attempts = match d.get("attempts") {
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Int32(n)) => *n as i64,
        _ => 0,
    };
    let attempts = u32::try_from(attempts)
        .map_err(|_| StoreError::malformed(format!("job {}: invalid attempts", id)))?;
    let status = d
        .get_str("status")
        .unwrap_or("pending")
        .parse::<JobStatus>()
        .map_err(|e| StoreError::malformed(format!("job {}: {}", id, e)))?;
    Ok(NotificationJob {
        next_attempt_at: from_bson_time(d, "next_attempt_at")?,
        created_at: from_bson_time(d, "created_at")?,
        id: JobId::from(id),
        recipient,
        payload,
        attempts,
        status,
    })
}
