use std::env;
use std::path::PathBuf;
use std::time::Duration;

use send_notifications_module::{EmailAddress, OversizePolicy, SmtpSettings};
use tracing::warn;

use crate::formatter::TimeZoneSetting;
use crate::rate_limit::RateSettings;

use super::BoxError;

pub const DEFAULT_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_MESSAGE_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_RELAY_NAME: &str = "电子信箱";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Include the `error` detail in HTTP responses.
    pub debug: bool,
    pub name: String,
    pub web_url: String,
    /// Empty means any `http(s)` origin is accepted.
    pub allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    /// Bearer token for `POST /inbound/email`. Unset means direct loopback
    /// callers only.
    pub inbound_token: Option<String>,
    pub body_max_bytes: usize,
    pub message_max_bytes: usize,
    pub webhook_url: Option<String>,
    pub webhook_upload_url: Option<String>,
    pub webhook_oversize: OversizePolicy,
    pub smtp: SmtpSettings,
    pub notice_list: Vec<EmailAddress>,
    pub recipient_list: Vec<EmailAddress>,
    pub sqlite_path: Option<PathBuf>,
    pub time_zone: TimeZoneSetting,
    pub rate: RateSettings,
    pub rate_sweep_interval: Duration,
    pub mailbox_poll_interval: Duration,
    pub mailbox_idle_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("RELAY_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3352);
        let name = env_var_non_empty("RELAY_NAME").unwrap_or_else(|| DEFAULT_RELAY_NAME.to_string());

        let webhook_oversize = match env_var_non_empty("RELAY_WEBHOOK_OVERSIZE") {
            Some(value) => value.parse::<OversizePolicy>()?,
            None => OversizePolicy::default(),
        };

        let smtp = SmtpSettings {
            address: env::var("RELAY_SMTP_ADDRESS").unwrap_or_default().trim().to_string(),
            user: env::var("RELAY_SMTP_USER").unwrap_or_default().trim().to_string(),
            password: env::var("RELAY_SMTP_PASSWORD").unwrap_or_default(),
            helo: env_var_non_empty("RELAY_SMTP_HELO").unwrap_or_else(|| "localhost".to_string()),
            timeout: env_secs("RELAY_SMTP_TIMEOUT_SECS", 30),
        };
        if !smtp.user.is_empty() && EmailAddress::parse(&smtp.user).is_none() {
            return Err(format!("RELAY_SMTP_USER is not a mail address: {}", smtp.user).into());
        }
        let notice_list = address_list("RELAY_NOTICE_LIST", &smtp.user);
        let recipient_list = address_list("RELAY_RECIPIENT_LIST", &smtp.user);

        let time_zone = TimeZoneSetting::parse(
            &env::var("RELAY_TIME_ZONE").unwrap_or_else(|_| "UTC".to_string()),
        );

        let rate = RateSettings {
            inbound_window: env_secs("RELAY_INBOUND_RATE_WINDOW_SECS", 300),
            inbound_max: env_number("RELAY_INBOUND_RATE_MAX", 2),
            reply_window: env_secs("RELAY_REPLY_RATE_WINDOW_SECS", 600),
            reply_max: env_number("RELAY_REPLY_RATE_MAX", 1),
        };

        Ok(Self {
            host,
            port,
            debug: env_flag("RELAY_DEBUG", false),
            name,
            web_url: env::var("RELAY_WEB_URL").unwrap_or_default().trim().to_string(),
            allowed_origins: string_list("RELAY_ALLOWED_ORIGINS"),
            trust_proxy_headers: env_flag("RELAY_TRUST_PROXY_HEADERS", false),
            inbound_token: env_var_non_empty("RELAY_INBOUND_TOKEN"),
            body_max_bytes: env_number("RELAY_BODY_MAX_BYTES", DEFAULT_BODY_MAX_BYTES as u64)
                as usize,
            message_max_bytes: env_number(
                "RELAY_MESSAGE_MAX_BYTES",
                DEFAULT_MESSAGE_MAX_BYTES as u64,
            ) as usize,
            webhook_url: env_var_non_empty("RELAY_WEBHOOK_URL"),
            webhook_upload_url: env_var_non_empty("RELAY_WEBHOOK_UPLOAD_URL"),
            webhook_oversize,
            smtp,
            notice_list,
            recipient_list,
            sqlite_path: env_var_non_empty("RELAY_SQLITE_PATH").map(PathBuf::from),
            time_zone,
            rate,
            rate_sweep_interval: env_secs("RELAY_RATE_SWEEP_SECS", 60),
            mailbox_poll_interval: env_secs("RELAY_MAILBOX_POLL_SECS", 15),
            mailbox_idle_interval: env_secs("RELAY_MAILBOX_IDLE_SECS", 300),
            shutdown_grace: env_secs("RELAY_SHUTDOWN_GRACE_SECS", 5),
        })
    }

    /// The relay's own mailbox, taken from the SMTP user.
    pub fn relay_address(&self) -> EmailAddress {
        EmailAddress::parse(&self.smtp.user)
            .unwrap_or_else(|| EmailAddress::bare(self.smtp.user.clone()))
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_number(key, default))
}

fn string_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|entry| entry.trim().trim_end_matches('/').to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn address_list(key: &str, fallback: &str) -> Vec<EmailAddress> {
    let list = EmailAddress::parse_list(&env::var(key).unwrap_or_default());
    if !list.is_empty() {
        return list;
    }
    match EmailAddress::parse(fallback) {
        Some(address) => vec![address],
        None => {
            if env::var(key).is_ok() {
                warn!("{} has no valid address and no fallback is configured", key);
            }
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "RELAY_HOST",
        "RELAY_PORT",
        "RELAY_DEBUG",
        "RELAY_NAME",
        "RELAY_ALLOWED_ORIGINS",
        "RELAY_INBOUND_TOKEN",
        "RELAY_WEBHOOK_OVERSIZE",
        "RELAY_SMTP_ADDRESS",
        "RELAY_SMTP_USER",
        "RELAY_NOTICE_LIST",
        "RELAY_RECIPIENT_LIST",
        "RELAY_SQLITE_PATH",
        "RELAY_TIME_ZONE",
        "RELAY_INBOUND_RATE_MAX",
        "RELAY_INBOUND_RATE_WINDOW_SECS",
        "RELAY_SHUTDOWN_GRACE_SECS",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clear() -> Self {
            let saved = KEYS
                .iter()
                .map(|key| (key.to_string(), env::var(key).ok()))
                .collect();
            for key in KEYS {
                env::remove_var(key);
            }
            Self { saved }
        }

        fn set(&self, key: &str, value: &str) {
            env::set_var(key, value);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, previous) in &self.saved {
                match previous {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        let _env = EnvGuard::clear();
        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3352);
        assert_eq!(config.name, DEFAULT_RELAY_NAME);
        assert!(!config.debug);
        assert!(config.allowed_origins.is_empty());
        assert!(config.inbound_token.is_none());
        assert_eq!(config.webhook_oversize, OversizePolicy::File);
        assert!(config.sqlite_path.is_none());
        assert!(config.notice_list.is_empty());
        assert_eq!(config.rate.inbound_max, 2);
        assert_eq!(config.rate.inbound_window, Duration::from_secs(300));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.time_zone.name(), "UTC");
    }

    #[test]
    #[serial]
    fn lists_fall_back_to_smtp_user() {
        let env = EnvGuard::clear();
        env.set("RELAY_SMTP_ADDRESS", "smtp.example.com:465");
        env.set("RELAY_SMTP_USER", "relay@example.com");
        env.set("RELAY_RECIPIENT_LIST", "a@example.com, Team <b@example.com>, nope");
        let config = ServiceConfig::from_env().expect("config");

        assert_eq!(config.notice_list, vec![EmailAddress::bare("relay@example.com")]);
        assert_eq!(
            config.recipient_list,
            vec![
                EmailAddress::bare("a@example.com"),
                EmailAddress::new("Team", "b@example.com"),
            ]
        );
        assert_eq!(config.relay_address().address, "relay@example.com");
    }

    #[test]
    #[serial]
    fn zero_or_garbage_numbers_use_defaults() {
        let env = EnvGuard::clear();
        env.set("RELAY_PORT", "not-a-port");
        env.set("RELAY_INBOUND_RATE_MAX", "0");
        env.set("RELAY_INBOUND_RATE_WINDOW_SECS", "-3");
        env.set("RELAY_DEBUG", "on");
        env.set("RELAY_ALLOWED_ORIGINS", "https://example.com/, *");
        env.set("RELAY_INBOUND_TOKEN", "  ");
        let config = ServiceConfig::from_env().expect("config");

        assert_eq!(config.port, 3352);
        assert_eq!(config.rate.inbound_max, 2);
        assert_eq!(config.rate.inbound_window, Duration::from_secs(300));
        assert!(config.debug);
        assert_eq!(config.allowed_origins, vec!["https://example.com", "*"]);
        assert!(config.inbound_token.is_none());
    }

    #[test]
    #[serial]
    fn invalid_oversize_policy_is_an_error() {
        let env = EnvGuard::clear();
        env.set("RELAY_WEBHOOK_OVERSIZE", "shrink");
        assert!(ServiceConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn invalid_smtp_user_is_an_error() {
        let env = EnvGuard::clear();
        env.set("RELAY_SMTP_USER", "not an address");
        assert!(ServiceConfig::from_env().is_err());
    }
}
