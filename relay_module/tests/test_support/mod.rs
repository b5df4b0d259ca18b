#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_module::service::{RelayContext, RelayParts, RelaySettings};
use relay_module::{EventStore, MessageEvent, RateSettings, RecordStore, StoreError};
use send_notifications_module::{
    DeliveryLog, EmailAddress, MailError, MailTransport, NoopDeliveryLog, OutgoingMail,
    TransportReport, WebhookConfig,
};
use tempfile::TempDir;
use tokio::runtime::Handle;

pub const RELAY_ADDRESS: &str = "relay@example.com";
pub const OWNER_ADDRESS: &str = "owner@example.com";

/// Mail transport that records every message it is handed.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MailTransport for RecordingTransport {
    fn deliver(&self, mail: &OutgoingMail) -> Result<TransportReport, MailError> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(TransportReport {
            accepted: mail.recipients.clone(),
            rejected: Vec::new(),
        })
    }
}

/// Store whose writes always fail.
#[derive(Default)]
pub struct FailingStore {
    pub saves: AtomicUsize,
}

impl EventStore for FailingStore {
    fn save_event(&self, _event: &MessageEvent) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::InvalidValue("database is locked".to_string()))
    }

    fn find_by_external_message_id(
        &self,
        _message_id: &str,
    ) -> Result<Option<MessageEvent>, StoreError> {
        Ok(None)
    }
}

pub fn temp_store() -> (TempDir, Arc<RecordStore>) {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path().join("state").join("relay.db")).unwrap();
    (dir, Arc::new(store))
}

pub fn settings() -> RelaySettings {
    let mut settings = RelaySettings::new(EmailAddress::bare(RELAY_ADDRESS));
    settings.notice_list = vec![EmailAddress::bare(OWNER_ADDRESS)];
    settings.debug = true;
    settings
}

pub struct RelayBuilder {
    pub settings: RelaySettings,
    pub webhook_url: String,
    pub transport: Option<Arc<RecordingTransport>>,
    pub store: Arc<dyn EventStore>,
    pub log: Arc<dyn DeliveryLog>,
    pub rate: RateSettings,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            settings: settings(),
            webhook_url: String::new(),
            transport: None,
            store: Arc::new(RecordStore::disabled()),
            log: Arc::new(NoopDeliveryLog),
            rate: RateSettings::default(),
        }
    }

    pub fn webhook(mut self, url: String) -> Self {
        self.webhook_url = url;
        self
    }

    pub fn transport(mut self, transport: Arc<RecordingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn record_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = store.clone();
        self.log = store;
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> RelayContext {
        let mut webhook = WebhookConfig::new(self.webhook_url);
        webhook.timeout = Duration::from_secs(5);
        RelayContext::new(
            RelayParts {
                settings: self.settings,
                webhook,
                transport: self
                    .transport
                    .map(|transport| transport as Arc<dyn MailTransport>),
                store: self.store,
                log: self.log,
                rate: self.rate,
            },
            Handle::current(),
        )
    }
}

pub fn webhook_url(server: &mockito::Server) -> String {
    format!("{}/cgi-bin/webhook/send?key=test", server.url())
}

pub async fn settle(relay: &RelayContext) {
    assert!(
        relay.drain(Duration::from_secs(10)).await,
        "fan-out did not settle in time"
    );
}
