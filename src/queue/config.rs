use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ConfigError;

/// Per-instance engine configuration. Fixed for the lifetime of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub poll_interval: Duration,
    /// `retry_delays[k]` is the wait imposed after the (k+1)-th failure.
    /// Its length is the maximum number of retries.
    pub retry_delays: Vec<Duration>,
    pub retention_window: Duration,
}

/// Completed jobs are kept for a day unless configured otherwise.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

impl QueueConfig {
    pub fn new(
        name: &str,
        poll_interval: Duration,
        retry_delays: Vec<Duration>,
        retention_window: Duration,
    ) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".into()));
        }
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "queue '{}': poll interval must be greater than zero",
                name
            )));
        }
        if retry_delays.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "queue '{}': at least one retry delay is required",
                name
            )));
        }
        Ok(QueueConfig {
            name: name.to_string(),
            poll_interval,
            retry_delays,
            retention_window,
        })
    }

    /// Registration welcome mail: poll every 30 minutes, retry after 2h, 6h, 24h.
    pub fn welcome() -> Self {
        QueueConfig {
            name: "welcome".to_string(),
            poll_interval: Duration::from_secs(30 * 60),
            retry_delays: vec![
                Duration::from_secs(2 * 60 * 60),
                Duration::from_secs(6 * 60 * 60),
                Duration::from_secs(24 * 60 * 60),
            ],
            retention_window: DEFAULT_RETENTION,
        }
    }

    /// Recruitment confirmation mail: poll every 5 minutes, retry after 15m, 1h, 4h.
    pub fn recruitment() -> Self {
        QueueConfig {
            name: "recruitment".to_string(),
            poll_interval: Duration::from_secs(5 * 60),
            retry_delays: vec![
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(4 * 60 * 60),
            ],
            retention_window: DEFAULT_RETENTION,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.retry_delays.len() as u32
    }

    /// Delay to impose after a failure when `attempts` failures were already
    /// recorded. `None` means the schedule is exhausted.
    pub fn retry_delay(&self, attempts: u32) -> Option<Duration> {
        self.retry_delays.get(attempts as usize).copied()
    }

    /// Completed jobs created before this instant are swept.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention_window)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// `now + delay`, saturating at the far future.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
