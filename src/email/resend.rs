use serde_json::json;

use crate::config::ResendConfig;

use super::{http_client, OutgoingEmail};

/// Send email via Resend API (https://resend.com/docs/api-reference/emails/send-email)
pub fn send(config: &ResendConfig, email: &OutgoingEmail) -> Result<(), String> {
    if config.api_key.is_empty() {
        return Err("Resend API key not configured".into());
    }

    let mut payload = json!({
        "from": email.from,
        "to": [email.to],
        "subject": email.subject,
        "html": email.html
    });
    if let Some(reply_to) = &email.reply_to {
        payload["reply_to"] = json!(reply_to);
    }

    let resp = http_client()?
        .post("https://api.resend.com/emails")
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .map_err(|e| format!("Resend request failed: {}", e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        return Err(format!("Resend returned {}: {}", status, text));
    }

    Ok(())
}
