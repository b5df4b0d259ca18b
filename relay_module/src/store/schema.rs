pub(super) const RELAY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS message_events (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    external_message_id TEXT,
    body_json TEXT NOT NULL,
    received_at TEXT NOT NULL,
    stored_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_events_external
    ON message_events (external_message_id);

CREATE TABLE IF NOT EXISTS delivery_attempts (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT NOT NULL,
    event_id TEXT,
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT,
    endpoint TEXT,
    mail_sender TEXT,
    mail_from TEXT,
    mail_subject TEXT,
    in_reply_to TEXT,
    file_payload TEXT,
    file_status TEXT,
    file_error TEXT,
    media_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_attempts_correlation
    ON delivery_attempts (correlation_id);
CREATE INDEX IF NOT EXISTS idx_delivery_attempts_event
    ON delivery_attempts (event_id);

CREATE TABLE IF NOT EXISTS delivery_recipients (
    attempt_row_id INTEGER NOT NULL REFERENCES delivery_attempts (row_id),
    address TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_recipients_attempt
    ON delivery_recipients (attempt_row_id);
"#;
