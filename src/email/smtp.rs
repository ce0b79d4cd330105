use crate::config::SmtpConfig;

use super::{send_smtp, OutgoingEmail};

pub fn send(config: &SmtpConfig, email: &OutgoingEmail) -> Result<(), String> {
    if config.host.is_empty() || config.username.is_empty() {
        return Err("SMTP host or username not configured".into());
    }

    send_smtp(
        &config.host,
        config.port,
        &config.username,
        &config.password,
        email,
    )
}
