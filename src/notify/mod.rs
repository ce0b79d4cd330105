//! The two notification kinds the site sends, as typed queue payloads.

pub mod recruitment;
pub mod welcome;

use std::sync::Arc;

pub use recruitment::RecruitmentEmail;
pub use welcome::WelcomeEmail;

use crate::config::AppConfig;
use crate::email::MailTransport;
use crate::queue::job::JobId;
use crate::queue::{NotificationQueue, QueueError};
use crate::store::Backend;

/// Both notification queues, built once at startup and shared with handlers.
pub struct Notifier {
    pub welcome: NotificationQueue<WelcomeEmail>,
    pub recruitment: NotificationQueue<RecruitmentEmail>,
}

impl Notifier {
    pub fn new(config: &AppConfig, backend: &Backend) -> Result<Self, String> {
        let welcome_config = config.welcome_queue().map_err(|e| e.to_string())?;
        let recruitment_config = config.recruitment_queue().map_err(|e| e.to_string())?;

        let welcome = NotificationQueue::new(
            welcome_config,
            backend
                .store_for("welcome")
                .map_err(|e| e.to_string())?,
            Arc::new(MailTransport::new(&config.mail, &config.mail.welcome_from)),
        );
        let recruitment = NotificationQueue::new(
            recruitment_config,
            backend
                .store_for("recruitment")
                .map_err(|e| e.to_string())?,
            Arc::new(MailTransport::new(&config.mail, &config.mail.recruitment_from)),
        );
        Ok(Notifier {
            welcome,
            recruitment,
        })
    }

    /// Queue the registration welcome mail for a new member.
    pub fn welcome_member(
        &self,
        email: &str,
        name: &str,
        token: &str,
        member_id: &str,
    ) -> Result<JobId, QueueError> {
        self.welcome.submit(
            email,
            &WelcomeEmail {
                name: name.to_string(),
                token: token.to_string(),
                member_id: member_id.to_string(),
            },
        )
    }

    /// Queue the "application received" mail for a recruitment applicant.
    pub fn confirm_application(
        &self,
        email: &str,
        name: &str,
        recruitment_title: &str,
        whatsapp_url: Option<&str>,
    ) -> Result<JobId, QueueError> {
        self.recruitment.submit(
            email,
            &RecruitmentEmail::application_received(name, recruitment_title, whatsapp_url),
        )
    }

    pub fn start(&self) {
        self.welcome.start();
        self.recruitment.start();
    }

    pub fn stop(&self) {
        self.welcome.stop();
        self.recruitment.stop();
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
