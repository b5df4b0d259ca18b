use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use send_notifications_module::EmailAddress;

use crate::identity::{inbound_event_id, system_event_id, web_event_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Website,
    Email,
    System,
}

impl EventKind {
    /// Label shown in the rendered header.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Website => "WebsiteMessage - 网页留言",
            EventKind::Email => "EmailMessage - 邮箱留言",
            EventKind::System => "SystemMessage - 系统留言",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Website => "website",
            EventKind::Email => "email",
            EventKind::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "website" => Some(EventKind::Website),
            "email" => Some(EventKind::Email),
            "system" => Some(EventKind::System),
            _ => None,
        }
    }
}

/// A validated web form submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSubmission {
    pub name: String,
    pub email: Option<EmailAddress>,
    pub message: String,
    pub refer: String,
    pub origin: String,
    pub host: String,
    pub client_ip: String,
    pub anonymous: bool,
    pub name_altered: bool,
    pub original_name_len: usize,
    pub message_altered: bool,
    pub original_message_len: usize,
}

/// An inbound mail that passed recipient, sender and body checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub message_id: String,
    pub sender: EmailAddress,
    pub from: EmailAddress,
    pub reply_to: EmailAddress,
    /// The relay address the mail was sent to, with the relay's name.
    pub recipient: EmailAddress,
    pub subject: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub content_altered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    Website(WebSubmission),
    Email(InboundEmail),
    System(SystemNotice),
}

/// One inbound message that needs fan-out. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub body: EventBody,
}

impl MessageEvent {
    pub fn web(submission: WebSubmission, received_at: DateTime<Utc>) -> Self {
        Self::from_body(EventBody::Website(submission), received_at)
    }

    pub fn inbound(mail: InboundEmail, received_at: DateTime<Utc>) -> Self {
        Self::from_body(EventBody::Email(mail), received_at)
    }

    pub fn system(notice: SystemNotice, received_at: DateTime<Utc>) -> Self {
        Self::from_body(EventBody::System(notice), received_at)
    }

    pub fn from_body(body: EventBody, received_at: DateTime<Utc>) -> Self {
        let id = derive_id(&body, received_at);
        Self {
            id,
            received_at,
            body,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::Website(_) => EventKind::Website,
            EventBody::Email(_) => EventKind::Email,
            EventBody::System(_) => EventKind::System,
        }
    }

    pub fn derive_id(&self) -> String {
        derive_id(&self.body, self.received_at)
    }

    pub fn verify_id(&self) -> bool {
        self.derive_id() == self.id
    }

    /// Protocol message id of an inbound mail.
    pub fn external_message_id(&self) -> Option<&str> {
        match &self.body {
            EventBody::Email(mail) => Some(mail.message_id.as_str()),
            _ => None,
        }
    }

    /// Address a thank-you or rejection can go to.
    pub fn reply_address(&self) -> Option<&EmailAddress> {
        match &self.body {
            EventBody::Website(web) => web.email.as_ref(),
            EventBody::Email(mail) => Some(&mail.reply_to),
            EventBody::System(_) => None,
        }
    }
}

fn derive_id(body: &EventBody, received_at: DateTime<Utc>) -> String {
    match body {
        EventBody::Website(web) => web_event_id(
            &web.name,
            web.email.as_ref(),
            &web.message,
            &web.refer,
            &web.origin,
            &web.host,
            &web.client_ip,
            received_at,
        ),
        EventBody::Email(mail) => inbound_event_id(
            &mail.message_id,
            &mail.sender,
            &mail.from,
            &mail.recipient,
            &mail.reply_to,
            &mail.subject,
            &mail.content,
            mail.sent_at,
            received_at,
        ),
        EventBody::System(notice) => {
            system_event_id(&notice.subject, &notice.content, received_at)
        }
    }
}
