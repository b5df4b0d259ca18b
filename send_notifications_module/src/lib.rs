//! Channel senders for the relay: the chat webhook, outbound SMTP, and the
//! delivery log each sender writes its own attempt rows through.

pub mod address;
pub mod attempt;
pub mod mail;
pub mod smtp;
pub mod webhook;

use sha2::{Digest, Sha256};

pub use address::{is_valid_email, EmailAddress};
pub use attempt::{
    AttemptDetail, AttemptStatus, ChannelKind, DeliveryLog, DeliveryLogError, NewAttempt,
    NoopDeliveryLog,
};
pub use mail::{
    mail_attempt_id, MailError, MailFailure, MailSender, MailTransport, OutgoingMail,
    TransportReport,
};
pub use smtp::{split_host_port, SmtpRelay, SmtpSettings};
pub use webhook::{
    split_for_webhook, webhook_attempt_id, FileDelivery, OversizePolicy, SplitDelivery,
    WebhookConfig, WebhookError, WebhookFailure, WebhookSender, FRAGMENT_LIMIT_BYTES,
    MARKDOWN_LIMIT_BYTES, TEXT_LIMIT_BYTES,
};

/// Hex-encoded SHA-256 of `text`.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a character.
pub fn truncate_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        assert_eq!(truncate_bytes("你好世界", 7), "你好");
        assert_eq!(truncate_bytes("hello", 10), "hello");
        assert_eq!(truncate_bytes("你", 2), "");
    }

    #[test]
    fn truncate_chars_counts_scalars() {
        assert_eq!(truncate_chars("你好世界", 3), "你好世");
    }
}
