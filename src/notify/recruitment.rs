use serde::{Deserialize, Serialize};

use crate::email::{EmailTemplate, TemplateContext};

use super::html_escape;

/// Confirmation sent to a recruitment applicant. Subject and body are
/// rendered by the caller when the application is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecruitmentEmail {
    pub name: String,
    pub subject: String,
    pub html: String,
}

impl RecruitmentEmail {
    /// The "application received" message, with an optional group invite link.
    pub fn application_received(name: &str, title: &str, whatsapp_url: Option<&str>) -> Self {
        let display_name = if name.trim().is_empty() {
            "Applicant".to_string()
        } else {
            html_escape(name.trim())
        };
        let title_html = html_escape(title);
        let group_line = match whatsapp_url.filter(|u| !u.is_empty()) {
            Some(url) => format!(
                "<p>Join the recruitment WhatsApp group for updates: \
                 <a href=\"{}\">Join our WhatsApp group</a></p>",
                html_escape(url)
            ),
            None => String::new(),
        };
        RecruitmentEmail {
            name: name.trim().to_string(),
            subject: format!("Application Received: {}", title),
            html: format!(
                "<p>Dear {display_name},</p>\
                 <p>Thank you for applying to <strong>{title_html}</strong>. \
                 We have received your recruitment application.</p>\
                 {group_line}\
                 <p>We will get back to you soon.<br/>MIT-WPU Science &amp; Spirituality Forum</p>"
            ),
        }
    }
}

impl EmailTemplate for RecruitmentEmail {
    fn subject(&self) -> String {
        self.subject.clone()
    }

    fn html(&self, _ctx: &TemplateContext) -> String {
        self.html.clone()
    }
}
