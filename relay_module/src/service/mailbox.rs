//! Inbound mailbox polling.
//!
//! The loop pulls unseen mail from a [`MailboxSource`] and hands each one to
//! the inbound processor. Connection trouble backs off and retries; repeated
//! command failures raise a system notice and end the loop. Every wait is
//! sliced so a stop request is honored within a fraction of a second, even
//! while idling on a source that can wake the loop early.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::background::{pause, slice, BackgroundControl};
use super::inbound::ParsedMail;
use super::state::RelayContext;

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox connection failed: {0}")]
    Connect(String),
    #[error("mailbox command failed: {0}")]
    Command(String),
    #[error("mailbox does not support a required capability: {0}")]
    Unsupported(String),
}

/// Capability that yields unseen inbound mail.
pub trait MailboxSource: Send + Sync {
    fn fetch_unseen(&self) -> Result<Vec<ParsedMail>, MailboxError>;

    /// Whether [`MailboxSource::wait`] can return early on new mail.
    fn supports_wake(&self) -> bool {
        false
    }

    /// Blocks up to `timeout`; `true` when new mail may be waiting.
    fn wait(&self, timeout: Duration) -> bool {
        std::thread::sleep(timeout);
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MailboxTiming {
    pub poll_interval: Duration,
    /// Cycle length when the source can wake the loop early.
    pub idle_interval: Duration,
    pub connect_backoff: Duration,
    pub command_backoff: Duration,
    /// Consecutive command failures tolerated before the loop gives up.
    pub command_error_limit: u32,
}

impl Default for MailboxTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            idle_interval: Duration::from_secs(300),
            connect_backoff: Duration::from_secs(10),
            command_backoff: Duration::from_secs(15),
            command_error_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxExit {
    Stopped,
    Unsupported,
    TooManyCommandErrors,
}

pub fn start_mailbox(
    control: &mut BackgroundControl,
    relay: RelayContext,
    source: Arc<dyn MailboxSource>,
    timing: MailboxTiming,
) {
    control.spawn(move |stop| {
        let exit = run_mailbox_loop(&relay, source.as_ref(), &timing, &stop);
        info!("mailbox loop exited: {:?}", exit);
    });
}

pub fn run_mailbox_loop(
    relay: &RelayContext,
    source: &dyn MailboxSource,
    timing: &MailboxTiming,
    stop: &AtomicBool,
) -> MailboxExit {
    info!("mailbox loop started");
    let mut command_errors = 0u32;
    while !stop.load(Ordering::Relaxed) {
        match source.fetch_unseen() {
            Ok(mails) => {
                if command_errors > 0 {
                    info!("mailbox recovered after {} command error(s)", command_errors);
                }
                command_errors = 0;
                for mail in mails {
                    let outcome = relay.process_inbound_email(mail);
                    debug!("inbound mail outcome: {:?}", outcome);
                }
                let cycle = if source.supports_wake() {
                    timing.idle_interval
                } else {
                    timing.poll_interval
                };
                idle(source, cycle, stop);
            }
            Err(MailboxError::Connect(err)) => {
                warn!("mailbox connect failed, retrying: {}", err);
                pause(timing.connect_backoff, stop);
            }
            Err(MailboxError::Command(err)) => {
                command_errors += 1;
                warn!(
                    "mailbox command failed ({} in a row): {}",
                    command_errors, err
                );
                if command_errors > timing.command_error_limit {
                    error!("mailbox command errors over the limit, stopping mailbox loop");
                    let name = &relay.settings().name;
                    relay.send_system_notice(
                        &format!("【{}】系统通知", name),
                        "连接 IMAP 服务器出现多次命令错误，超过10次重启 IMAP 服务，现将要停止 IMAP 服务。",
                    );
                    return MailboxExit::TooManyCommandErrors;
                }
                pause(timing.command_backoff, stop);
            }
            Err(MailboxError::Unsupported(err)) => {
                error!("mailbox unusable, stopping mailbox loop: {}", err);
                return MailboxExit::Unsupported;
            }
        }
    }
    MailboxExit::Stopped
}

fn idle(source: &dyn MailboxSource, cycle: Duration, stop: &AtomicBool) {
    if !source.supports_wake() {
        pause(cycle, stop);
        return;
    }
    let deadline = Instant::now() + cycle;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline || source.wait(slice(deadline - now)) {
            return;
        }
    }
}

/// In-process mailbox fed by the HTTP boundary.
#[derive(Debug, Default)]
pub struct InboxQueue {
    queue: Mutex<VecDeque<ParsedMail>>,
    arrived: Condvar,
}

impl InboxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mail: ParsedMail) {
        self.lock().push_back(mail);
        self.arrived.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ParsedMail>> {
        self.queue
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl MailboxSource for InboxQueue {
    fn fetch_unseen(&self) -> Result<Vec<ParsedMail>, MailboxError> {
        Ok(self.lock().drain(..).collect())
    }

    fn supports_wake(&self) -> bool {
        true
    }

    fn wait(&self, timeout: Duration) -> bool {
        let queue = self.lock();
        if !queue.is_empty() {
            return true;
        }
        let (queue, _) = self
            .arrived
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|poison| poison.into_inner());
        !queue.is_empty()
    }
}
