mod schema;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use send_notifications_module::{
    AttemptDetail, AttemptStatus, ChannelKind, DeliveryLog, DeliveryLogError, NewAttempt,
};

use crate::event::{EventBody, MessageEvent};

use schema::RELAY_SCHEMA;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("failed to encode event body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("mail id check failed: {0}")]
    IdMismatch(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("delivery attempt not found: {0}")]
    NotFound(String),
}

/// Durable history of message events.
pub trait EventStore: Send + Sync {
    fn save_event(&self, event: &MessageEvent) -> Result<(), StoreError>;

    /// Looks up an inbound mail event by the protocol message id it arrived with.
    fn find_by_external_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageEvent>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttempt {
    pub correlation_id: String,
    pub event_id: Option<String>,
    pub channel: ChannelKind,
    pub status: AttemptStatus,
    pub payload: String,
    pub error: Option<String>,
    pub endpoint: Option<String>,
    pub mail_subject: Option<String>,
    pub in_reply_to: Option<String>,
    pub recipients: Vec<String>,
    pub file_status: Option<AttemptStatus>,
    pub file_error: Option<String>,
    pub media_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed event and delivery attempt store.
///
/// Without a path every write succeeds without touching disk and every
/// lookup finds nothing.
#[derive(Debug)]
pub struct RecordStore {
    path: Option<PathBuf>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: Some(path.into()),
        };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Attempts for one event, oldest first.
    pub fn list_attempts(&self, event_id: &str) -> Result<Vec<StoredAttempt>, StoreError> {
        let Some(conn) = self.open()? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT row_id FROM delivery_attempts WHERE event_id = ?1 ORDER BY row_id",
        )?;
        let rows = stmt.query_map(params![event_id], |row| row.get::<_, i64>(0))?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(load_attempt(&conn, row?)?);
        }
        Ok(attempts)
    }

    /// Newest attempt carrying `correlation_id`.
    pub fn find_attempt(&self, correlation_id: &str) -> Result<Option<StoredAttempt>, StoreError> {
        let Some(conn) = self.open()? else {
            return Ok(None);
        };
        let row_id = newest_row(&conn, correlation_id)?;
        match row_id {
            Some(row_id) => Ok(Some(load_attempt(&conn, row_id)?)),
            None => Ok(None),
        }
    }

    fn open(&self) -> Result<Option<Connection>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(RELAY_SCHEMA)?;
        Ok(Some(conn))
    }

    fn insert_attempt(&self, attempt: &NewAttempt) -> Result<(), StoreError> {
        let Some(mut conn) = self.open()? else {
            return Ok(());
        };
        let tx = conn.transaction()?;
        let (endpoint, sender, from, subject, in_reply_to, recipients) = match &attempt.detail {
            AttemptDetail::Webhook { endpoint } => {
                (Some(endpoint.as_str()), None, None, None, None, &[] as &[String])
            }
            AttemptDetail::Mail {
                sender,
                from,
                subject,
                in_reply_to,
                recipients,
            } => (
                None,
                Some(sender.as_str()),
                Some(from.as_str()),
                Some(subject.as_str()),
                in_reply_to.as_deref(),
                recipients.as_slice(),
            ),
        };
        let created_at = format_datetime(attempt.created_at);
        tx.execute(
            "INSERT INTO delivery_attempts (
                correlation_id, event_id, channel, status, payload, endpoint,
                mail_sender, mail_from, mail_subject, in_reply_to, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                attempt.correlation_id,
                attempt.event_id,
                attempt.channel.as_str(),
                AttemptStatus::Pending.as_str(),
                attempt.payload,
                endpoint,
                sender,
                from,
                subject,
                in_reply_to,
                created_at
            ],
        )?;
        let row_id = tx.last_insert_rowid();
        for address in recipients {
            tx.execute(
                "INSERT INTO delivery_recipients (attempt_row_id, address) VALUES (?1, ?2)",
                params![row_id, address],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_outcome(&self, correlation_id: &str, error: Option<&str>) -> Result<(), StoreError> {
        let Some(conn) = self.open()? else {
            return Ok(());
        };
        let row_id = newest_row(&conn, correlation_id)?
            .ok_or_else(|| StoreError::NotFound(correlation_id.to_string()))?;
        conn.execute(
            "UPDATE delivery_attempts SET status = ?1, error = ?2, updated_at = ?3 WHERE row_id = ?4",
            params![
                AttemptStatus::from_error(error).as_str(),
                error,
                format_datetime(Utc::now()),
                row_id
            ],
        )?;
        Ok(())
    }

    fn update_file(
        &self,
        correlation_id: &str,
        payload: Option<&str>,
        outcome: Option<(Option<&str>, Option<&str>)>,
    ) -> Result<(), StoreError> {
        let Some(conn) = self.open()? else {
            return Ok(());
        };
        let row_id = newest_row(&conn, correlation_id)?
            .ok_or_else(|| StoreError::NotFound(correlation_id.to_string()))?;
        let now = format_datetime(Utc::now());
        if let Some(payload) = payload {
            conn.execute(
                "UPDATE delivery_attempts SET file_payload = ?1, file_status = ?2, updated_at = ?3
                 WHERE row_id = ?4",
                params![payload, AttemptStatus::Pending.as_str(), now, row_id],
            )?;
        }
        if let Some((media_id, error)) = outcome {
            conn.execute(
                "UPDATE delivery_attempts SET file_status = ?1, file_error = ?2, media_id = ?3,
                 updated_at = ?4 WHERE row_id = ?5",
                params![
                    AttemptStatus::from_error(error).as_str(),
                    error,
                    media_id,
                    now,
                    row_id
                ],
            )?;
        }
        Ok(())
    }
}

impl EventStore for RecordStore {
    fn save_event(&self, event: &MessageEvent) -> Result<(), StoreError> {
        if !event.verify_id() {
            return Err(StoreError::IdMismatch(event.id.clone()));
        }
        let Some(conn) = self.open()? else {
            return Ok(());
        };
        let body_json = serde_json::to_string(&event.body)?;
        conn.execute(
            "INSERT INTO message_events (id, kind, external_message_id, body_json, received_at, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.kind().as_str(),
                event.external_message_id(),
                body_json,
                format_datetime(event.received_at),
                format_datetime(Utc::now())
            ],
        )?;
        Ok(())
    }

    fn find_by_external_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageEvent>, StoreError> {
        let Some(conn) = self.open()? else {
            return Ok(None);
        };
        let row = conn
            .query_row(
                "SELECT id, body_json, received_at FROM message_events
                 WHERE external_message_id = ?1
                 ORDER BY received_at DESC
                 LIMIT 1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, body_json, received_at)) = row else {
            return Ok(None);
        };
        let body: EventBody = serde_json::from_str(&body_json)?;
        let event = MessageEvent {
            id,
            received_at: parse_datetime(&received_at)?,
            body,
        };
        if !event.verify_id() {
            return Err(StoreError::IdMismatch(event.id));
        }
        Ok(Some(event))
    }
}

impl DeliveryLog for RecordStore {
    fn save_attempt(&self, attempt: &NewAttempt) -> Result<(), DeliveryLogError> {
        self.insert_attempt(attempt).map_err(into_log_error)
    }

    fn record_outcome(
        &self,
        correlation_id: &str,
        error: Option<&str>,
    ) -> Result<(), DeliveryLogError> {
        self.update_outcome(correlation_id, error)
            .map_err(into_log_error)
    }

    fn save_file_attempt(
        &self,
        correlation_id: &str,
        payload: &str,
    ) -> Result<(), DeliveryLogError> {
        self.update_file(correlation_id, Some(payload), None)
            .map_err(into_log_error)
    }

    fn record_file_outcome(
        &self,
        correlation_id: &str,
        media_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DeliveryLogError> {
        self.update_file(correlation_id, None, Some((media_id, error)))
            .map_err(into_log_error)
    }
}

fn into_log_error(err: StoreError) -> DeliveryLogError {
    DeliveryLogError(err.to_string())
}

fn newest_row(conn: &Connection, correlation_id: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT row_id FROM delivery_attempts WHERE correlation_id = ?1
             ORDER BY row_id DESC LIMIT 1",
            params![correlation_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?)
}

fn load_attempt(conn: &Connection, row_id: i64) -> Result<StoredAttempt, StoreError> {
    let row = conn.query_row(
        "SELECT correlation_id, event_id, channel, status, payload, error, endpoint,
                mail_subject, in_reply_to, file_status, file_error, media_id,
                created_at, updated_at
         FROM delivery_attempts WHERE row_id = ?1",
        params![row_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, String>(13)?,
            ))
        },
    )?;
    let (
        correlation_id,
        event_id,
        channel,
        status,
        payload,
        error,
        endpoint,
        mail_subject,
        in_reply_to,
        file_status,
        file_error,
        media_id,
        created_at,
        updated_at,
    ) = row;

    let mut stmt = conn.prepare(
        "SELECT address FROM delivery_recipients WHERE attempt_row_id = ?1 ORDER BY rowid",
    )?;
    let recipients = stmt
        .query_map(params![row_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoredAttempt {
        correlation_id,
        event_id,
        channel: channel.parse().map_err(StoreError::InvalidValue)?,
        status: status.parse().map_err(StoreError::InvalidValue)?,
        payload,
        error,
        endpoint,
        mail_subject,
        in_reply_to,
        recipients,
        file_status: file_status
            .map(|value| value.parse().map_err(StoreError::InvalidValue))
            .transpose()?,
        file_error,
        media_id,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests;
