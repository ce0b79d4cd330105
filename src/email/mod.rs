pub mod postmark;
pub mod resend;
pub mod smtp;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no email provider configured or enabled")]
    NotConfigured,
    #[error("{provider} failed: {message}")]
    Provider { provider: String, message: String },
    #[error("undeliverable payload: {0}")]
    Payload(String),
}

/// The delivery capability a queue calls for each due job.
///
/// Every `Err` is treated by the queue as a retryable failure. Implementations
/// must tolerate being called again with the same arguments.
pub trait Transport<P>: Send + Sync {
    fn send(&self, recipient: &str, payload: &P) -> Result<(), TransportError>;
}

/// Values a template may need beyond its own payload.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub client_url: String,
}

/// A payload that knows how to render itself as an HTML email.
pub trait EmailTemplate {
    fn subject(&self) -> String;
    fn html(&self, ctx: &TemplateContext) -> String;
}

/// A fully rendered message, as handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Mail transport sending through the configured provider chain.
pub struct MailTransport {
    config: MailConfig,
    from: String,
    ctx: TemplateContext,
}

impl MailTransport {
    pub fn new(config: &MailConfig, from: &str) -> Self {
        MailTransport {
            config: config.clone(),
            from: from.to_string(),
            ctx: TemplateContext {
                client_url: config.client_url.clone(),
            },
        }
    }

    pub fn render<P: EmailTemplate>(&self, recipient: &str, payload: &P) -> OutgoingEmail {
        OutgoingEmail {
            from: self.from.clone(),
            reply_to: self.config.reply_to.clone(),
            to: recipient.to_string(),
            subject: payload.subject(),
            html: payload.html(&self.ctx),
        }
    }
}

impl<P> Transport<P> for MailTransport
where
    P: EmailTemplate + Sync,
{
    fn send(&self, recipient: &str, payload: &P) -> Result<(), TransportError> {
        let email = self.render(recipient, payload);
        send_via_chain(&self.config, &email)
    }
}

/// Send through the first configured provider in `config.chain`.
/// With failover enabled the next provider is tried after a failure.
pub fn send_via_chain(config: &MailConfig, email: &OutgoingEmail) -> Result<(), TransportError> {
    let mut last_error = None;

    for provider_name in &config.chain {
        let result = match provider_name.as_str() {
            "resend" => match &config.resend {
                Some(c) => resend::send(c, email),
                None => continue,
            },
            "postmark" => match &config.postmark {
                Some(c) => postmark::send(c, email),
                None => continue,
            },
            "smtp" => match &config.smtp {
                Some(c) => smtp::send(c, email),
                None => continue,
            },
            _ => {
                log::warn!("[email] Unknown email provider: {}", provider_name);
                continue;
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("[email] Provider {} failed: {}", provider_name, e);
                let err = TransportError::Provider {
                    provider: provider_name.clone(),
                    message: e,
                };
                if !config.failover {
                    return Err(err);
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(TransportError::NotConfigured))
}

/// Shared SMTP send used by smtp.rs
pub fn send_smtp(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    email: &OutgoingEmail,
) -> Result<(), String> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&email.from, "from")?)
        .to(parse_mailbox(&email.to, "to")?)
        .subject(email.subject.as_str())
        .header(ContentType::TEXT_HTML);
    if let Some(reply_to) = &email.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to, "reply-to")?);
    }
    let message = builder
        .body(email.html.clone())
        .map_err(|e| format!("Failed to build email: {}", e))?;

    let creds = Credentials::new(username.to_string(), password.to_string());

    let mailer = SmtpTransport::starttls_relay(host)
        .map_err(|e| format!("SMTP relay error: {}", e))?
        .port(port)
        .credentials(creds)
        .build();

    mailer
        .send(&message)
        .map_err(|e| format!("SMTP send error: {}", e))?;
    Ok(())
}

fn parse_mailbox(addr: &str, field: &str) -> Result<Mailbox, String> {
    addr.parse()
        .map_err(|e| format!("Invalid {} address '{}': {}", field, addr, e))
}

pub(crate) fn http_client() -> Result<reqwest::blocking::Client, String> {
    reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| format!("HTTP client error: {}", e))
}
