use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};

use send_notifications_module::EmailAddress;

use crate::event::{InboundEmail, MessageEvent};
use crate::filter::{display_safe, normalize, normalize_lines, FieldError, FieldRule, Overflow};
use crate::formatter::reply_subject;

use super::state::RelayContext;

pub const REJECT_TOO_FAST: &str = "信件发送速度过快、次数过多";
pub const REJECT_EMPTY: &str = "邮件内容为空";
pub const REJECT_UNSAFE: &str = "邮件存在不安全因素";
pub const REJECT_TOO_LARGE: &str = "邮件太大了，建议使用云附件哦";

const CLAIMED_ID_CAPACITY: usize = 4096;

/// Message-ids taken for processing, newest last. Covers the window before
/// an event row exists in the store.
#[derive(Debug, Default)]
pub(super) struct ClaimedIds {
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl ClaimedIds {
    /// `false` when `message_id` was already claimed.
    pub(super) fn claim(&self, message_id: &str) -> bool {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (seen, order) = &mut *guard;
        if !seen.insert(message_id.to_string()) {
            return false;
        }
        order.push_back(message_id.to_string());
        if order.len() > CLAIMED_ID_CAPACITY {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        true
    }
}

/// One inbound mail as the mailbox source hands it over: addresses already
/// parsed, body already decoded to plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    pub message_id: String,
    pub sender: Option<EmailAddress>,
    pub from: Option<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub body: String,
}

/// JSON document accepted by `POST /inbound/email`; addresses are written
/// the way they appear in mail headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundDocument {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: String,
}

impl InboundDocument {
    pub fn into_parsed(self) -> ParsedMail {
        ParsedMail {
            message_id: self.message_id.trim().to_string(),
            sender: EmailAddress::parse(&self.sender),
            from: EmailAddress::parse(&self.from),
            reply_to: EmailAddress::parse_list(&self.reply_to),
            to: EmailAddress::parse_list(&self.to),
            subject: self.subject,
            date: self.date,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Fan-out launched for the event with this id.
    Dispatched(String),
    /// Dropped without a reply.
    Ignored(&'static str),
    /// Refused; a rejection notice went through the reply gate.
    Rejected(&'static str),
}

impl RelayContext {
    /// Handles one inbound mail. Fire-and-forget: callers only log the outcome.
    pub fn process_inbound_email(&self, mail: ParsedMail) -> InboundOutcome {
        let Some(recipient) = self.matching_recipient(&mail.to) else {
            return ignore(&mail, "not addressed to the relay");
        };

        if !mail.message_id.is_empty() {
            if !self.claimed.claim(&mail.message_id) {
                return ignore(&mail, "already handled");
            }
            match self.store.find_by_external_message_id(&mail.message_id) {
                Ok(Some(_)) => return ignore(&mail, "already handled"),
                Ok(None) => {}
                Err(err) => error!(
                    "dedup lookup for {} failed, processing anyway: {}",
                    mail.message_id, err
                ),
            }
        }

        let Some(sender) = mail.sender.clone().filter(EmailAddress::is_valid) else {
            return ignore(&mail, "sender missing or invalid");
        };
        let from = mail
            .from
            .clone()
            .filter(EmailAddress::is_valid)
            .unwrap_or_else(|| sender.clone());
        let reply_to = mail
            .reply_to
            .iter()
            .find(|address| address.is_valid())
            .cloned()
            .unwrap_or_else(|| from.clone());

        let (subject, _) = display_safe(&normalize_lines(&mail.subject));
        let subject = subject.trim().to_string();

        if self.limits.check_inbound(&[&sender, &from, &reply_to]) {
            return self.reject_inbound(&mail, &reply_to, &subject, REJECT_TOO_FAST);
        }

        let rule = FieldRule::bytes(self.settings.message_max_bytes, Overflow::CompressThenReject);
        let content = match normalize(&mail.body, &rule) {
            Ok(content) => content,
            Err(FieldError::Empty) => {
                return self.reject_inbound(&mail, &reply_to, &subject, REJECT_EMPTY)
            }
            Err(FieldError::Unsafe) => {
                return self.reject_inbound(&mail, &reply_to, &subject, REJECT_UNSAFE)
            }
            Err(FieldError::TooLong { .. }) => {
                return self.reject_inbound(&mail, &reply_to, &subject, REJECT_TOO_LARGE)
            }
        };

        let received_at = Utc::now();
        let inbound = InboundEmail {
            message_id: mail.message_id.clone(),
            sender,
            from,
            reply_to,
            recipient,
            subject,
            content: content.text,
            sent_at: mail.date.unwrap_or(received_at),
            content_altered: content.altered,
        };
        let launched = self.dispatch(MessageEvent::inbound(inbound, received_at));
        info!(
            "accepted inbound mail {} as {}",
            mail.message_id, launched.event_id
        );
        InboundOutcome::Dispatched(launched.event_id)
    }

    fn matching_recipient(&self, to: &[EmailAddress]) -> Option<EmailAddress> {
        to.iter()
            .find(|address| {
                self.settings
                    .recipient_list
                    .iter()
                    .any(|recipient| recipient.same_mailbox(address))
            })
            .cloned()
    }

    fn reject_inbound(
        &self,
        mail: &ParsedMail,
        reply_to: &EmailAddress,
        subject: &str,
        reason: &'static str,
    ) -> InboundOutcome {
        info!("inbound mail {} refused: {}", mail.message_id, reason);
        if self.mailer.is_configured() {
            let mailer = self.mailer.clone();
            let to = reply_to.clone();
            let subject = reply_subject(subject);
            let in_reply_to = Some(mail.message_id.clone()).filter(|id| !id.is_empty());
            self.fanout.spawn_detached("inbound rejection", move || {
                if let Err(err) =
                    mailer.send_rejection(&to, &subject, in_reply_to.as_deref(), reason, Utc::now())
                {
                    warn!("rejection mail to {} failed: {}", to.address, err);
                }
            });
        }
        InboundOutcome::Rejected(reason)
    }
}

fn ignore(mail: &ParsedMail, reason: &'static str) -> InboundOutcome {
    info!("inbound mail {} ignored: {}", mail.message_id, reason);
    InboundOutcome::Ignored(reason)
}
