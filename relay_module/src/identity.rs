//! Content-derived identifiers for message events.
//!
//! Each id is the hex SHA-256 of a kind tag followed by the defining fields
//! and the UNIX second of receipt, separated by newlines. The same inputs
//! always produce the same id, which is how stored events are verified.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use send_notifications_module::EmailAddress;

fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn optional_address(address: Option<&EmailAddress>) -> String {
    address.map(ToString::to_string).unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
pub fn web_event_id(
    name: &str,
    email: Option<&EmailAddress>,
    message: &str,
    refer: &str,
    origin: &str,
    host: &str,
    client_ip: &str,
    received_at: DateTime<Utc>,
) -> String {
    digest(&format!(
        "AM-{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        name,
        optional_address(email),
        message,
        refer,
        origin,
        host,
        client_ip,
        received_at.timestamp()
    ))
}

#[allow(clippy::too_many_arguments)]
pub fn inbound_event_id(
    message_id: &str,
    sender: &EmailAddress,
    from: &EmailAddress,
    recipient: &EmailAddress,
    reply_to: &EmailAddress,
    subject: &str,
    content: &str,
    sent_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
) -> String {
    digest(&format!(
        "IMAP-{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        message_id,
        sender,
        from,
        recipient,
        reply_to,
        subject,
        content,
        sent_at.timestamp(),
        received_at.timestamp()
    ))
}

pub fn system_event_id(subject: &str, content: &str, received_at: DateTime<Utc>) -> String {
    digest(&format!(
        "SYSTEM-NOTIFY-{}\n{}\n{}",
        subject,
        content,
        received_at.timestamp()
    ))
}
