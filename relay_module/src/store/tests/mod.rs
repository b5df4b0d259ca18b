use super::{EventStore, RecordStore, StoreError};
use crate::event::fixtures::{inbound_email, received, web_submission};
use crate::event::{EventBody, MessageEvent};
use chrono::Utc;
use send_notifications_module::{
    AttemptDetail, AttemptStatus, ChannelKind, DeliveryLog, NewAttempt,
};
use tempfile::TempDir;

fn test_store() -> (TempDir, RecordStore) {
    let dir = TempDir::new().expect("tempdir");
    let store = RecordStore::new(dir.path().join("state").join("relay.db")).expect("store");
    (dir, store)
}

fn webhook_attempt(correlation_id: &str, event_id: &str) -> NewAttempt {
    NewAttempt {
        correlation_id: correlation_id.to_string(),
        event_id: Some(event_id.to_string()),
        channel: ChannelKind::Webhook,
        payload: "hello".to_string(),
        created_at: Utc::now(),
        detail: AttemptDetail::Webhook {
            endpoint: "https://qyapi.example.com/cgi-bin/webhook/send".to_string(),
        },
    }
}

#[test]
fn saves_and_finds_inbound_event_by_message_id() {
    let (_dir, store) = test_store();
    let event = MessageEvent::inbound(inbound_email(), received());
    store.save_event(&event).expect("save");

    let found = store
        .find_by_external_message_id("<abc@mail.example.org>")
        .expect("find")
        .expect("present");
    assert_eq!(found, event);
    assert!(store
        .find_by_external_message_id("<other@mail.example.org>")
        .expect("find")
        .is_none());
}

#[test]
fn rejects_event_whose_id_does_not_match() {
    let (_dir, store) = test_store();
    let mut event = MessageEvent::web(web_submission(), received());
    event.id = "0".repeat(64);
    let err = store.save_event(&event).expect_err("mismatch");
    assert!(matches!(err, StoreError::IdMismatch(_)));
    assert!(err.to_string().starts_with("mail id check failed"));
}

#[test]
fn detects_tampered_rows_on_load() {
    let (dir, store) = test_store();
    let event = MessageEvent::inbound(inbound_email(), received());
    store.save_event(&event).expect("save");

    let mut tampered = inbound_email();
    tampered.content = "changed".to_string();
    let json = serde_json::to_string(&EventBody::Email(tampered)).expect("json");
    let conn = rusqlite::Connection::open(dir.path().join("state").join("relay.db")).expect("open");
    conn.execute("UPDATE message_events SET body_json = ?1", [json])
        .expect("update");

    let err = store
        .find_by_external_message_id("<abc@mail.example.org>")
        .expect_err("tampered");
    assert!(matches!(err, StoreError::IdMismatch(_)));
}

#[test]
fn attempt_lifecycle_moves_from_pending_to_outcome() {
    let (_dir, store) = test_store();
    store
        .save_attempt(&webhook_attempt("corr-1", "event-1"))
        .expect("reserve");

    let pending = store.find_attempt("corr-1").expect("find").expect("row");
    assert_eq!(pending.status, AttemptStatus::Pending);
    assert_eq!(pending.channel, ChannelKind::Webhook);

    store
        .record_outcome("corr-1", Some("platform reported error"))
        .expect("outcome");
    let failed = store.find_attempt("corr-1").expect("find").expect("row");
    assert_eq!(failed.status, AttemptStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("platform reported error"));
}

#[test]
fn outcome_updates_only_the_newest_matching_row() {
    let (_dir, store) = test_store();
    store.save_attempt(&webhook_attempt("corr-2", "event-2")).expect("first");
    store.save_attempt(&webhook_attempt("corr-2", "event-2")).expect("second");
    store.record_outcome("corr-2", None).expect("outcome");

    let attempts = store.list_attempts("event-2").expect("list");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, AttemptStatus::Pending);
    assert_eq!(attempts[1].status, AttemptStatus::Success);
}

#[test]
fn file_fields_land_on_the_same_row() {
    let (_dir, store) = test_store();
    store.save_attempt(&webhook_attempt("corr-3", "event-3")).expect("reserve");
    store.record_outcome("corr-3", None).expect("text sent");
    store.save_file_attempt("corr-3", "long body").expect("file reserve");
    store
        .record_file_outcome("corr-3", Some("media-1"), None)
        .expect("file sent");

    let row = store.find_attempt("corr-3").expect("find").expect("row");
    assert_eq!(row.status, AttemptStatus::Success);
    assert_eq!(row.file_status, Some(AttemptStatus::Success));
    assert_eq!(row.media_id.as_deref(), Some("media-1"));
}

#[test]
fn mail_attempt_keeps_recipients() {
    let (_dir, store) = test_store();
    let attempt = NewAttempt {
        correlation_id: "corr-4".to_string(),
        event_id: None,
        channel: ChannelKind::ThankYou,
        payload: "thanks".to_string(),
        created_at: Utc::now(),
        detail: AttemptDetail::Mail {
            sender: "relay@example.com".to_string(),
            from: "relay@example.com".to_string(),
            subject: "Re: hi".to_string(),
            in_reply_to: Some("<abc@example.org>".to_string()),
            recipients: vec!["a@example.com".to_string(), "b@example.com".to_string()],
        },
    };
    store.save_attempt(&attempt).expect("reserve");

    let row = store.find_attempt("corr-4").expect("find").expect("row");
    assert_eq!(row.recipients, vec!["a@example.com", "b@example.com"]);
    assert_eq!(row.in_reply_to.as_deref(), Some("<abc@example.org>"));
    assert_eq!(row.mail_subject.as_deref(), Some("Re: hi"));
}

#[test]
fn outcome_for_unknown_correlation_id_is_an_error() {
    let (_dir, store) = test_store();
    assert!(store.record_outcome("missing", None).is_err());
}

#[test]
fn disabled_store_is_a_silent_no_op() {
    let store = RecordStore::disabled();
    let event = MessageEvent::web(web_submission(), received());
    store.save_event(&event).expect("save");
    store.save_attempt(&webhook_attempt("c", "e")).expect("reserve");
    store.record_outcome("c", None).expect("outcome");
    assert!(store
        .find_by_external_message_id("<abc@mail.example.org>")
        .expect("find")
        .is_none());
    assert!(store.list_attempts("e").expect("list").is_empty());
    assert!(!store.is_enabled());
}
