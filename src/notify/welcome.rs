use serde::{Deserialize, Serialize};

use crate::email::{EmailTemplate, TemplateContext};

use super::html_escape;

const SUBJECT: &str = "Welcome to MIT-WPU Science & Spirituality Forum";

/// Sent after member registration; links to the member's badge page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeEmail {
    pub name: String,
    /// Badge token issued at registration.
    pub token: String,
    pub member_id: String,
}

impl WelcomeEmail {
    pub fn badge_link(&self, ctx: &TemplateContext) -> String {
        format!(
            "{}/member/badge/{}",
            ctx.client_url.trim_end_matches('/'),
            self.token
        )
    }
}

impl EmailTemplate for WelcomeEmail {
    fn subject(&self) -> String {
        SUBJECT.to_string()
    }

    fn html(&self, ctx: &TemplateContext) -> String {
        let name = html_escape(&self.name);
        let member_id = html_escape(&self.member_id);
        format!(
            "<p>Dear {name},</p>\
             <p>Thank you for registering with MIT-WPU Science &amp; Spirituality Forum. \
             We are excited to have you on board.</p>\
             <p>Your registration details are as follows:</p>\
             <ul>\
             <li><strong>Name:</strong> {name}</li>\
             <li><strong>Member ID:</strong> {member_id}</li>\
             </ul>\
             <p>Please click on the link below to view your badge:</p>\
             <p><a href=\"{link}\">View Badge</a></p>\
             <p>Best regards,<br/>MIT-WPU Science &amp; Spirituality Forum Team</p>",
            link = html_escape(&self.badge_link(ctx)),
        )
    }
}
