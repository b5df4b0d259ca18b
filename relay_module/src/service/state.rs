use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use send_notifications_module::{
    DeliveryLog, EmailAddress, MailSender, MailTransport, OversizePolicy, SmtpRelay,
    WebhookConfig, WebhookSender,
};

use crate::fanout::{Fanout, InFlight};
use crate::formatter::{Formatter, TimeZoneSetting};
use crate::mailer::Mailer;
use crate::rate_limit::{RateLimits, RateSettings};
use crate::store::{EventStore, RecordStore};

use super::config::{ServiceConfig, DEFAULT_MESSAGE_MAX_BYTES, DEFAULT_RELAY_NAME};
use super::inbound::ClaimedIds;
use super::mailbox::InboxQueue;
use super::BoxError;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) relay: RelayContext,
    pub(super) inbox: Arc<InboxQueue>,
}

/// Relay-wide knobs the intake processors read.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub name: String,
    pub relay_address: EmailAddress,
    pub notice_list: Vec<EmailAddress>,
    /// Inbound mail is only handled when addressed to one of these.
    pub recipient_list: Vec<EmailAddress>,
    pub web_url: String,
    pub time_zone: TimeZoneSetting,
    pub debug: bool,
    pub message_max_bytes: usize,
    pub webhook_oversize: OversizePolicy,
}

impl RelaySettings {
    pub fn new(relay_address: EmailAddress) -> Self {
        Self {
            name: DEFAULT_RELAY_NAME.to_string(),
            notice_list: vec![relay_address.clone()],
            recipient_list: vec![relay_address.clone()],
            relay_address,
            web_url: String::new(),
            time_zone: TimeZoneSetting::Utc,
            debug: false,
            message_max_bytes: DEFAULT_MESSAGE_MAX_BYTES,
            webhook_oversize: OversizePolicy::File,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            relay_address: config.relay_address(),
            notice_list: config.notice_list.clone(),
            recipient_list: config.recipient_list.clone(),
            web_url: config.web_url.clone(),
            time_zone: config.time_zone,
            debug: config.debug,
            message_max_bytes: config.message_max_bytes,
            webhook_oversize: config.webhook_oversize,
        }
    }
}

/// Everything a relay context is assembled from.
pub struct RelayParts {
    pub settings: RelaySettings,
    pub webhook: WebhookConfig,
    /// `None` turns every mail channel off.
    pub transport: Option<Arc<dyn MailTransport>>,
    pub store: Arc<dyn EventStore>,
    pub log: Arc<dyn DeliveryLog>,
    pub rate: RateSettings,
}

/// Application context shared by the HTTP boundary and the mailbox loop.
#[derive(Clone)]
pub struct RelayContext {
    pub(super) settings: Arc<RelaySettings>,
    pub(super) formatter: Formatter,
    pub(super) webhook: Arc<WebhookSender>,
    pub(super) mail: Arc<MailSender>,
    pub(super) mailer: Mailer,
    pub(super) limits: Arc<RateLimits>,
    pub(super) store: Arc<dyn EventStore>,
    pub(super) claimed: Arc<ClaimedIds>,
    pub(super) fanout: Fanout,
}

impl RelayContext {
    pub fn new(parts: RelayParts, runtime: Handle) -> Self {
        let RelayParts {
            settings,
            webhook,
            transport,
            store,
            log,
            rate,
        } = parts;
        let formatter = Formatter::new(
            settings.time_zone,
            settings.name.clone(),
            settings.web_url.clone(),
        );
        let limits = Arc::new(RateLimits::new(rate));
        let mail = Arc::new(MailSender::new(
            transport,
            log.clone(),
            settings.relay_address.clone(),
            settings.notice_list.clone(),
            settings.name.clone(),
        ));
        let mailer = Mailer::new(mail.clone(), limits.clone(), formatter.clone());
        let webhook = Arc::new(WebhookSender::new(webhook, log.clone()));
        let fanout = Fanout::new(runtime, store.clone(), log, Arc::new(InFlight::new()));
        Self {
            settings: Arc::new(settings),
            formatter,
            webhook,
            mail,
            mailer,
            limits,
            store,
            claimed: Arc::new(ClaimedIds::default()),
            fanout,
        }
    }

    /// Builds the production context: sqlite record store and SMTP relay
    /// when configured, otherwise those pieces are switched off.
    pub fn from_config(config: &ServiceConfig, runtime: Handle) -> Result<Self, BoxError> {
        let store = Arc::new(match &config.sqlite_path {
            Some(path) => RecordStore::new(path)?,
            None => {
                info!("no record store configured, delivery history is not kept");
                RecordStore::disabled()
            }
        });

        let transport: Option<Arc<dyn MailTransport>> = if config.smtp.is_configured() {
            Some(Arc::new(SmtpRelay::new(config.smtp.clone())?))
        } else {
            warn!("smtp is not configured, mail channels are off");
            None
        };

        let mut webhook = WebhookConfig::new(config.webhook_url.clone().unwrap_or_default());
        webhook.upload_url = config.webhook_upload_url.clone();
        if config.webhook_url.is_none() {
            warn!("webhook url is not configured, webhook channel is off");
        }

        Ok(Self::new(
            RelayParts {
                settings: RelaySettings::from_config(config),
                webhook,
                transport,
                store: store.clone(),
                log: store,
                rate: config.rate,
            },
            runtime,
        ))
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn limits(&self) -> &Arc<RateLimits> {
        &self.limits
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        self.fanout.in_flight()
    }

    /// Waits for in-flight fan-out up to `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = self.in_flight().drain(grace).await;
        if !drained {
            warn!(
                "abandoning {} in-flight delivery group(s) after {:?}",
                self.in_flight().active(),
                grace
            );
        }
        drained
    }
}
