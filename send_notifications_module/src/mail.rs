use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::address::EmailAddress;
use crate::attempt::{
    AttemptDetail, ChannelKind, DeliveryLog, DeliveryLogError, NewAttempt, ERROR_LIMIT_CHARS,
    PAYLOAD_LIMIT_BYTES,
};
use crate::{sha256_hex, truncate_bytes, truncate_chars};

const HEADER_LIMIT_CHARS: usize = 100;
const IN_REPLY_TO_LIMIT_CHARS: usize = 1020;

/// One outbound plain-text mail.
///
/// `sender` is the envelope sender and the account used to authenticate;
/// `from` and `reply_to` only shape the headers.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub sender: EmailAddress,
    pub from: EmailAddress,
    pub reply_to: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub in_reply_to: Option<String>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportReport {
    pub accepted: Vec<EmailAddress>,
    pub rejected: Vec<EmailAddress>,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("smtp is not configured")]
    NotConfigured,
    #[error("no valid recipient")]
    NoValidRecipient,
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("failed to format smtp address: {0}")]
    ServerAddress(String),
    #[error(transparent)]
    Log(#[from] DeliveryLogError),
}

/// Transport the mail sender hands a fully addressed message to.
pub trait MailTransport: Send + Sync {
    fn deliver(&self, mail: &OutgoingMail) -> Result<TransportReport, MailError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct MailFailure {
    pub correlation_id: Option<String>,
    #[source]
    pub source: MailError,
}

impl MailFailure {
    fn new(correlation_id: Option<String>, source: MailError) -> Self {
        Self {
            correlation_id,
            source,
        }
    }
}

pub struct MailSender {
    transport: Option<Arc<dyn MailTransport>>,
    log: Arc<dyn DeliveryLog>,
    relay: EmailAddress,
    notice_list: Vec<EmailAddress>,
    name: String,
}

impl MailSender {
    /// `relay` is the relay's own mailbox; `notice_list` receives send-to-self mail.
    pub fn new(
        transport: Option<Arc<dyn MailTransport>>,
        log: Arc<dyn DeliveryLog>,
        relay: EmailAddress,
        notice_list: Vec<EmailAddress>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            log,
            relay,
            notice_list,
            name: name.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    pub fn relay_address(&self) -> &EmailAddress {
        &self.relay
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notice_list(&self) -> &[EmailAddress] {
        &self.notice_list
    }

    /// Forwards a rendered notification to the operator's notice list.
    pub fn send_to_self(
        &self,
        subject: &str,
        body: &str,
        date: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<String, MailFailure> {
        let mail = OutgoingMail {
            subject: format!("【{} 消息提醒】 {}", self.name, subject),
            body: body.to_string(),
            sender: self.relay.clone(),
            from: self.relay.clone(),
            reply_to: self.relay.clone(),
            recipients: self.notice_list.clone(),
            in_reply_to: None,
            date,
        };
        self.send(&mail, ChannelKind::Email, event_id)
    }

    /// Reserves an attempt row, hands the mail to the transport, and settles the row.
    pub fn send(
        &self,
        mail: &OutgoingMail,
        channel: ChannelKind,
        event_id: Option<&str>,
    ) -> Result<String, MailFailure> {
        let Some(transport) = &self.transport else {
            return Err(MailFailure::new(None, MailError::NotConfigured));
        };

        let correlation_id = mail_attempt_id(mail);
        let attempt = NewAttempt {
            correlation_id: correlation_id.clone(),
            event_id: event_id.map(str::to_string),
            channel,
            payload: truncate_bytes(&mail.body, PAYLOAD_LIMIT_BYTES).to_string(),
            created_at: mail.date,
            detail: AttemptDetail::Mail {
                sender: truncate_chars(&mail.sender.to_string(), HEADER_LIMIT_CHARS),
                from: truncate_chars(&mail.from.to_string(), HEADER_LIMIT_CHARS),
                subject: truncate_chars(&mail.subject, HEADER_LIMIT_CHARS),
                in_reply_to: mail
                    .in_reply_to
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .map(|id| truncate_chars(id, IN_REPLY_TO_LIMIT_CHARS)),
                recipients: mail
                    .recipients
                    .iter()
                    .map(|recipient| recipient.address.clone())
                    .collect(),
            },
        };
        self.log
            .save_attempt(&attempt)
            .map_err(|err| MailFailure::new(None, err.into()))?;

        let result = deliver_valid(transport.as_ref(), mail);
        let detail = result
            .as_ref()
            .err()
            .map(|err| truncate_chars(&err.to_string(), ERROR_LIMIT_CHARS));
        if let Err(err) = self.log.record_outcome(&correlation_id, detail.as_deref()) {
            warn!("failed to record mail outcome for {}: {}", correlation_id, err);
        }

        match result {
            Ok(report) => {
                if !report.rejected.is_empty() {
                    warn!(
                        "mail {} rejected by server for {} recipient(s)",
                        correlation_id,
                        report.rejected.len()
                    );
                }
                info!(
                    "mail {} ({}) delivered to {} recipient(s)",
                    correlation_id,
                    channel,
                    report.accepted.len()
                );
                Ok(correlation_id)
            }
            Err(source) => Err(MailFailure::new(Some(correlation_id), source)),
        }
    }
}

fn deliver_valid(
    transport: &dyn MailTransport,
    mail: &OutgoingMail,
) -> Result<TransportReport, MailError> {
    let valid: Vec<EmailAddress> = mail
        .recipients
        .iter()
        .filter(|recipient| {
            let ok = recipient.is_valid();
            if !ok {
                warn!("{} is not a valid email, ignored", recipient.address);
            }
            ok
        })
        .cloned()
        .collect();
    if valid.is_empty() {
        return Err(MailError::NoValidRecipient);
    }
    let filtered;
    let mail = if valid.len() == mail.recipients.len() {
        mail
    } else {
        filtered = OutgoingMail {
            recipients: valid,
            ..mail.clone()
        };
        &filtered
    };
    let report = transport.deliver(mail)?;
    if report.accepted.is_empty() {
        return Err(MailError::NoValidRecipient);
    }
    Ok(report)
}

/// Correlation id of one outbound mail.
pub fn mail_attempt_id(mail: &OutgoingMail) -> String {
    let recipients: Vec<String> = mail.recipients.iter().map(ToString::to_string).collect();
    sha256_hex(&format!(
        "SMTP-{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        mail.subject,
        mail.body,
        mail.sender,
        mail.from,
        mail.reply_to,
        recipients.join(";"),
        mail.in_reply_to.as_deref().unwrap_or_default(),
        mail.date.timestamp()
    ))
}
