use serde_json::json;

use crate::config::PostmarkConfig;

use super::{http_client, OutgoingEmail};

/// Send email via Postmark API (https://postmarkapp.com/developer/api/email-api)
pub fn send(config: &PostmarkConfig, email: &OutgoingEmail) -> Result<(), String> {
    if config.server_token.is_empty() {
        return Err("Postmark server token not configured".into());
    }

    let mut payload = json!({
        "From": email.from,
        "To": email.to,
        "Subject": email.subject,
        "HtmlBody": email.html
    });
    if let Some(reply_to) = &email.reply_to {
        payload["ReplyTo"] = json!(reply_to);
    }

    let resp = http_client()?
        .post("https://api.postmarkapp.com/email")
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .header("X-Postmark-Server-Token", &config.server_token)
        .json(&payload)
        .send()
        .map_err(|e| format!("Postmark request failed: {}", e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        return Err(format!("Postmark returned {}: {}", status, text));
    }

    Ok(())
}
