//! Auto-replies: thank-you notes for accepted messages and rejection
//! notices for refused ones, both behind the per-recipient reply budget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use send_notifications_module::{ChannelKind, EmailAddress, MailFailure, MailSender, OutgoingMail};

use crate::event::{EventBody, MessageEvent};
use crate::formatter::{reply_subject, Formatter, ReplyModel};
use crate::rate_limit::{RateLimits, SendType};

pub const WEB_THANK_YOU_SUBJECT: &str = "我们已经收到你的信件啦！";
pub const REJECTION_SUBJECT: &str = "信件拒收通知";

#[derive(Clone)]
pub struct Mailer {
    mail: Arc<MailSender>,
    limits: Arc<RateLimits>,
    formatter: Formatter,
}

impl Mailer {
    pub fn new(mail: Arc<MailSender>, limits: Arc<RateLimits>, formatter: Formatter) -> Self {
        Self {
            mail,
            limits,
            formatter,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.mail.is_configured()
    }

    /// Whether `event` gets a thank-you branch at all.
    pub fn wants_thank_you(&self, event: &MessageEvent) -> bool {
        self.is_configured() && event.reply_address().is_some()
    }

    /// Sends the thank-you for an accepted event. `Ok(None)` means the send
    /// was skipped: nothing to reply to, or the recipient is over budget.
    pub fn send_thank_you(&self, event: &MessageEvent) -> Result<Option<String>, MailFailure> {
        if !self.is_configured() {
            return Ok(None);
        }
        let now = Utc::now();
        let relay = self.relay_identity();
        let (recipient, subject, in_reply_to, from) = match &event.body {
            EventBody::Website(web) => {
                let Some(email) = &web.email else {
                    return Ok(None);
                };
                let recipient = if web.anonymous {
                    email.clone()
                } else {
                    email.with_name(web.name.clone())
                };
                (recipient, WEB_THANK_YOU_SUBJECT.to_string(), None, relay.clone())
            }
            EventBody::Email(mail) => (
                mail.reply_to.clone(),
                reply_subject(&mail.subject),
                Some(mail.message_id.clone()),
                mail.recipient.with_name(self.formatter.relay_name()),
            ),
            EventBody::System(_) => return Ok(None),
        };

        if self.limits.check_reply(SendType::Thank, &recipient) {
            info!(
                "thank-you to {} skipped: reply budget exhausted",
                recipient.address
            );
            return Ok(None);
        }

        let body = self.formatter.thank_you_body(&ReplyModel {
            user: recipient.clone(),
            relay: from.clone(),
            error: None,
            date: now,
        });
        let mail = OutgoingMail {
            subject,
            body,
            sender: relay,
            from: from.clone(),
            reply_to: from,
            recipients: vec![recipient],
            in_reply_to,
            date: now,
        };
        self.mail
            .send(&mail, ChannelKind::ThankYou, Some(&event.id))
            .map(Some)
    }

    /// Tells `to` their message was refused. Over budget is a silent skip.
    pub fn send_rejection(
        &self,
        to: &EmailAddress,
        subject: &str,
        in_reply_to: Option<&str>,
        error_msg: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, MailFailure> {
        if !self.is_configured() {
            return Ok(None);
        }
        if self.limits.check_reply(SendType::Error, to) {
            info!("rejection to {} skipped: reply budget exhausted", to.address);
            return Ok(None);
        }

        let relay = self.relay_identity();
        let body = self.formatter.rejection_body(&ReplyModel {
            user: to.clone(),
            relay: relay.clone(),
            error: Some(error_msg.to_string()),
            date: now,
        });
        let mail = OutgoingMail {
            subject: subject.to_string(),
            body,
            sender: relay.clone(),
            from: relay.clone(),
            reply_to: relay,
            recipients: vec![to.clone()],
            in_reply_to: in_reply_to.map(str::to_string),
            date: now,
        };
        self.mail.send(&mail, ChannelKind::Rejection, None).map(Some)
    }

    fn relay_identity(&self) -> EmailAddress {
        self.mail
            .relay_address()
            .with_name(self.formatter.relay_name())
    }
}
