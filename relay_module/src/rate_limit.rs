use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use send_notifications_module::EmailAddress;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Fixed-window counter per key.
///
/// The first hit in a window sets its expiry; later hits in the same window
/// only increment. A key is over budget once its count exceeds the ceiling,
/// so exactly `ceiling` hits per window are allowed.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    ceiling: u64,
    counters: Mutex<HashMap<String, Counter>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, ceiling: u64) -> Self {
        Self {
            window,
            ceiling,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one hit for `key` and returns the count in the current window.
    pub fn hit(&self, key: &str) -> u64 {
        self.hit_at(key, Instant::now())
    }

    pub fn hit_at(&self, key: &str, now: Instant) -> u64 {
        let mut counters = self.lock();
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + self.window,
        });
        if now >= counter.expires_at {
            counter.count = 0;
            counter.expires_at = now + self.window;
        }
        counter.count += 1;
        counter.count
    }

    pub fn is_over(&self, count: u64) -> bool {
        count > self.ceiling
    }

    /// Counts one hit and reports whether `key` is now over budget.
    pub fn check(&self, key: &str) -> bool {
        let count = self.hit(key);
        self.is_over(count)
    }

    /// Drops expired counters; returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut counters = self.lock();
        let before = counters.len();
        counters.retain(|_, counter| now < counter.expires_at);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Kinds of outbound mail counted on the reply axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendType {
    Error,
    Thank,
}

impl SendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendType::Error => "error",
            SendType::Thank => "thank",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Allowed,
    IpLimited,
    EmailLimited,
    BothLimited,
}

#[derive(Debug, Clone, Copy)]
pub struct RateSettings {
    pub inbound_window: Duration,
    pub inbound_max: u64,
    pub reply_window: Duration,
    pub reply_max: u64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            inbound_window: Duration::from_secs(300),
            inbound_max: 2,
            reply_window: Duration::from_secs(600),
            reply_max: 1,
        }
    }
}

/// The three rate axes: client IP, sender email, and outbound send type
/// plus recipient address.
#[derive(Debug)]
pub struct RateLimits {
    ip: FixedWindowLimiter,
    email: FixedWindowLimiter,
    reply: FixedWindowLimiter,
}

impl RateLimits {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            ip: FixedWindowLimiter::new(settings.inbound_window, settings.inbound_max),
            email: FixedWindowLimiter::new(settings.inbound_window, settings.inbound_max),
            reply: FixedWindowLimiter::new(settings.reply_window, settings.reply_max),
        }
    }

    /// Counts a web submission on both axes. Both counters advance even
    /// when the first is already over budget.
    pub fn check_submission(&self, client_ip: &str, email: Option<&EmailAddress>) -> RateVerdict {
        let ip_over = self.ip.check(&format!("req:ip:[{}]", client_ip));
        let email_over = email
            .map(|address| self.email.check(&email_key(&address.address)))
            .unwrap_or(false);
        match (ip_over, email_over) {
            (true, true) => RateVerdict::BothLimited,
            (true, false) => RateVerdict::IpLimited,
            (false, true) => RateVerdict::EmailLimited,
            (false, false) => RateVerdict::Allowed,
        }
    }

    /// Counts an inbound mail once for every distinct address it names and
    /// reports whether the highest count is over budget.
    pub fn check_inbound(&self, addresses: &[&EmailAddress]) -> bool {
        let mut seen: Vec<String> = Vec::with_capacity(addresses.len());
        let mut highest = 0;
        for address in addresses {
            let key = email_key(&address.address);
            if address.address.is_empty() || seen.contains(&key) {
                continue;
            }
            highest = highest.max(self.email.hit(&key));
            seen.push(key);
        }
        self.email.is_over(highest)
    }

    /// Counts one auto-reply of `kind` to `address`; `true` when over budget.
    pub fn check_reply(&self, kind: SendType, address: &EmailAddress) -> bool {
        let key = format!(
            "smtp:email:{}[{}]",
            kind.as_str(),
            address.address.to_ascii_lowercase()
        );
        self.reply.check(&key)
    }

    pub fn sweep(&self) -> usize {
        self.ip.sweep() + self.email.sweep() + self.reply.sweep()
    }
}

fn email_key(address: &str) -> String {
    format!("req:email:[{}]", address.to_ascii_lowercase())
}
