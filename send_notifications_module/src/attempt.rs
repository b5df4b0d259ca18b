use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Stored payload ceiling for attempt rows.
pub const PAYLOAD_LIMIT_BYTES: usize = 10240;
/// Stored failure detail ceiling for attempt rows.
pub const ERROR_LIMIT_CHARS: usize = 190;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Webhook,
    Email,
    ThankYou,
    Rejection,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Email => "email",
            ChannelKind::ThankYou => "thank_you",
            ChannelKind::Rejection => "rejection",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "webhook" => Ok(ChannelKind::Webhook),
            "email" => Ok(ChannelKind::Email),
            "thank_you" => Ok(ChannelKind::ThankYou),
            "rejection" => Ok(ChannelKind::Rejection),
            other => Err(format!("unknown channel kind: {}", other)),
        }
    }
}

/// Outcome of one attempt. A row is `Pending` from the moment its
/// correlation id is reserved until the sender records the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn from_error(error: Option<&str>) -> Self {
        match error {
            Some(_) => AttemptStatus::Failed,
            None => AttemptStatus::Success,
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(AttemptStatus::Pending),
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(format!("unknown attempt status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDetail {
    Webhook {
        endpoint: String,
    },
    Mail {
        sender: String,
        from: String,
        subject: String,
        in_reply_to: Option<String>,
        recipients: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub correlation_id: String,
    pub event_id: Option<String>,
    pub channel: ChannelKind,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub detail: AttemptDetail,
}

#[derive(Debug, thiserror::Error)]
#[error("delivery log error: {0}")]
pub struct DeliveryLogError(pub String);

/// Write path for DeliveryAttempt rows.
///
/// Each sender reserves its row with `save_attempt` before any network
/// call and settles it afterwards. Outcome updates target the newest row
/// carrying the correlation id.
pub trait DeliveryLog: Send + Sync {
    fn save_attempt(&self, attempt: &NewAttempt) -> Result<(), DeliveryLogError>;

    fn record_outcome(
        &self,
        correlation_id: &str,
        error: Option<&str>,
    ) -> Result<(), DeliveryLogError>;

    fn save_file_attempt(&self, correlation_id: &str, payload: &str)
        -> Result<(), DeliveryLogError>;

    fn record_file_outcome(
        &self,
        correlation_id: &str,
        media_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DeliveryLogError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeliveryLog;

impl DeliveryLog for NoopDeliveryLog {
    fn save_attempt(&self, _attempt: &NewAttempt) -> Result<(), DeliveryLogError> {
        Ok(())
    }

    fn record_outcome(
        &self,
        _correlation_id: &str,
        _error: Option<&str>,
    ) -> Result<(), DeliveryLogError> {
        Ok(())
    }

    fn save_file_attempt(
        &self,
        _correlation_id: &str,
        _payload: &str,
    ) -> Result<(), DeliveryLogError> {
        Ok(())
    }

    fn record_file_outcome(
        &self,
        _correlation_id: &str,
        _media_id: Option<&str>,
        _error: Option<&str>,
    ) -> Result<(), DeliveryLogError> {
        Ok(())
    }
}
