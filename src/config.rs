use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::config::QueueConfig;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "notifier.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level `notifier.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mail: MailConfig,
    pub queues: QueuesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `sqlite` or `mongodb`
    pub backend: String,
    pub path: String,
    pub uri: String,
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: "sqlite".to_string(),
            path: "data/notifier.db".to_string(),
            uri: "mongodb://localhost:27017".to_string(),
            name: "forum".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub welcome_from: String,
    pub recruitment_from: String,
    pub reply_to: Option<String>,
    /// Base URL of the public site, used for badge links.
    pub client_url: String,
    /// Try the next provider in `chain` when one fails.
    pub failover: bool,
    pub chain: Vec<String>,
    pub resend: Option<ResendConfig>,
    pub postmark: Option<PostmarkConfig>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for MailConfig {
    fn default() -> Self {
        MailConfig {
            welcome_from: "MIT-WPU Science & Spirituality Forum <welcome@snsf.live>".to_string(),
            recruitment_from: "MIT-WPU SNSF <recruitment@snsf.live>".to_string(),
            reply_to: Some("snsf@mitwpu.edu.in".to_string()),
            client_url: "http://localhost:5173".to_string(),
            failover: false,
            chain: vec!["resend".to_string(), "postmark".to_string(), "smtp".to_string()],
            resend: None,
            postmark: None,
            smtp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResendConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostmarkConfig {
    pub server_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub welcome: QueueSettings,
    pub recruitment: QueueSettings,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        QueuesConfig {
            welcome: QueueSettings::from(&QueueConfig::welcome()),
            recruitment: QueueSettings::from(&QueueConfig::recruitment()),
        }
    }
}

/// File form of a queue's schedule, in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub poll_interval_secs: u64,
    pub retry_delays_secs: Vec<u64>,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_retention_secs() -> u64 {
    crate::queue::config::DEFAULT_RETENTION.as_secs()
}

impl From<&QueueConfig> for QueueSettings {
    fn from(c: &QueueConfig) -> Self {
        QueueSettings {
            poll_interval_secs: c.poll_interval.as_secs(),
            retry_delays_secs: c.retry_delays.iter().map(Duration::as_secs).collect(),
            retention_secs: c.retention_window.as_secs(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self, name: &str) -> Result<QueueConfig, ConfigError> {
        QueueConfig::new(
            name,
            Duration::from_secs(self.poll_interval_secs),
            self.retry_delays_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            Duration::from_secs(self.retention_secs),
        )
    }
}

impl AppConfig {
    /// Load from `$NOTIFIER_CONFIG` (or `notifier.toml`), falling back to
    /// defaults when the file is absent, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("NOTIFIER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.clone(),
                message: e.to_string(),
            })?;
            Self::from_toml_str(&raw)?
        } else {
            log::info!("[config] {} not found, using defaults", path);
            AppConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `MONGO_URI`, `RESEND_API_KEY` and `CLIENT_URL` win over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(uri) = lookup("MONGO_URI") {
            self.database.uri = uri;
        }
        if let Some(key) = lookup("RESEND_API_KEY") {
            self.mail.resend = Some(ResendConfig { api_key: key });
        }
        if let Some(url) = lookup("CLIENT_URL") {
            self.mail.client_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.database.backend.as_str() {
            "sqlite" | "mongodb" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown database backend '{}'",
                    other
                )))
            }
        }
        self.welcome_queue()?;
        self.recruitment_queue()?;
        Ok(())
    }

    pub fn welcome_queue(&self) -> Result<QueueConfig, ConfigError> {
        self.queues.welcome.to_queue_config("welcome")
    }

    pub fn recruitment_queue(&self) -> Result<QueueConfig, ConfigError> {
        self.queues.recruitment.to_queue_config("recruitment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_presets() {
        let c = AppConfig::default();
        c.validate().unwrap();
        assert_eq!(c.welcome_queue().unwrap(), QueueConfig::welcome());
        assert_eq!(c.recruitment_queue().unwrap(), QueueConfig::recruitment());
        assert_eq!(c.database.backend, "sqlite");
    }

    #[test]
    fn test_parse_partial_file() {
        let c = AppConfig::from_toml_str(
            r#"
            [database]
            backend = "mongodb"
            uri = "mongodb://db:27017"

            [mail]
            failover = true
            chain = ["postmark", "smtp"]

            [mail.smtp]
            host = "smtp.example.com"
            username = "mailer"

            [queues.recruitment]
            poll_interval_secs = 60
            retry_delays_secs = [10, 30, 60]
            "#,
        )
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.database.backend, "mongodb");
        assert_eq!(c.database.name, "forum");
        assert!(c.mail.failover);
        assert_eq!(c.mail.smtp.as_ref().unwrap().port, 587);
        let r = c.recruitment_queue().unwrap();
        assert_eq!(r.poll_interval, Duration::from_secs(60));
        assert_eq!(r.retry_delays.len(), 3);
        assert_eq!(r.retention_window, Duration::from_secs(86400));
        assert_eq!(c.welcome_queue().unwrap(), QueueConfig::welcome());
    }

    #[test]
    fn test_empty_retry_schedule_is_rejected() {
        let c = AppConfig::from_toml_str(
            r#"
            [queues.welcome]
            poll_interval_secs = 60
            retry_delays_secs = []
            "#,
        )
        .unwrap();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut c = AppConfig::default();
        c.database.backend = "postgres".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            AppConfig::from_toml_str("[database"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MONGO_URI", "mongodb://prod:27017"),
            ("RESEND_API_KEY", "re_test"),
            ("CLIENT_URL", ""),
        ]
        .into_iter()
        .collect();
        let mut c = AppConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.database.uri, "mongodb://prod:27017");
        assert_eq!(c.mail.resend.unwrap().api_key, "re_test");
        // empty values are ignored
        assert_eq!(c.mail.client_url, "http://localhost:5173");
    }
}
