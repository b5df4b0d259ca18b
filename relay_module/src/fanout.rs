//! Concurrent fan-out of one message event to its delivery channels.
//!
//! Launching an event starts the persistence write and one task per
//! channel branch. Every branch waits on a single persist signal and only
//! runs its network work once the event is stored. Branch bodies run on the
//! blocking pool; a panic inside one is caught at its join point, logged,
//! and recorded as a failed attempt without touching its siblings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use send_notifications_module::{
    sha256_hex, AttemptDetail, ChannelKind, DeliveryLog, NewAttempt,
};

use crate::event::MessageEvent;
use crate::store::EventStore;

pub type BranchError = Box<dyn std::error::Error + Send + Sync>;

type BranchFn = Box<dyn FnOnce() -> Result<(), BranchError> + Send + 'static>;

/// One channel send, prepared up front and run after persistence.
pub struct Branch {
    channel: ChannelKind,
    run: BranchFn,
}

impl Branch {
    pub fn new(
        channel: ChannelKind,
        run: impl FnOnce() -> Result<(), BranchError> + Send + 'static,
    ) -> Self {
        Self {
            channel,
            run: Box::new(run),
        }
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistState {
    Pending,
    Persisted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Delivered,
    Failed(String),
    /// Persistence failed; no network call was made.
    Skipped,
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct FanoutReport {
    pub event_id: String,
    pub persisted: bool,
    pub branches: Vec<(ChannelKind, BranchOutcome)>,
}

impl FanoutReport {
    pub fn outcome(&self, channel: ChannelKind) -> Option<&BranchOutcome> {
        self.branches
            .iter()
            .find(|(kind, _)| *kind == channel)
            .map(|(_, outcome)| outcome)
    }
}

/// Counts fan-out groups and detached sends still running.
#[derive(Debug, Default)]
pub struct InFlight {
    active: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    /// Waits until nothing is in flight or `grace` passes. Returns `false`
    /// when work was abandoned.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Handle to a launched event. Dropping it detaches the group.
pub struct Launched {
    pub event_id: String,
    supervisor: JoinHandle<FanoutReport>,
}

impl Launched {
    /// Waits for every branch of the group to settle.
    pub async fn finished(self) -> Option<FanoutReport> {
        match self.supervisor.await {
            Ok(report) => Some(report),
            Err(err) => {
                error!("fanout supervisor for {} failed: {}", self.event_id, err);
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct Fanout {
    runtime: Handle,
    store: Arc<dyn EventStore>,
    log: Arc<dyn DeliveryLog>,
    in_flight: Arc<InFlight>,
}

impl Fanout {
    pub fn new(
        runtime: Handle,
        store: Arc<dyn EventStore>,
        log: Arc<dyn DeliveryLog>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            runtime,
            store,
            log,
            in_flight,
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Starts persistence and every branch, then returns without waiting.
    pub fn launch(&self, event: MessageEvent, branches: Vec<Branch>) -> Launched {
        let guard = self.in_flight.enter();
        let event_id = event.id.clone();
        let (persist_tx, persist_rx) = watch::channel(PersistState::Pending);

        let store = self.store.clone();
        let persist = self.runtime.spawn_blocking(move || {
            let state = match store.save_event(&event) {
                Ok(()) => PersistState::Persisted,
                Err(err) => {
                    error!("failed to persist event {}: {}", event.id, err);
                    PersistState::Failed
                }
            };
            let _ = persist_tx.send(state);
            state
        });

        let channels: Vec<ChannelKind> = branches.iter().map(Branch::channel).collect();
        let mut set = JoinSet::new();
        for (index, branch) in branches.into_iter().enumerate() {
            let rx = persist_rx.clone();
            let event_id = event_id.clone();
            let runtime = self.runtime.clone();
            let log = self.log.clone();
            set.spawn_on(
                async move {
                    let outcome = run_branch(runtime, log, &event_id, branch, rx).await;
                    (index, outcome)
                },
                &self.runtime,
            );
        }
        drop(persist_rx);

        let supervisor_id = event_id.clone();
        let supervisor = self.runtime.spawn(async move {
            let _guard = guard;
            let persisted = match persist.await {
                Ok(state) => state == PersistState::Persisted,
                Err(err) => {
                    error!("persistence task for {} aborted: {}", supervisor_id, err);
                    false
                }
            };

            let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; channels.len()];
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, outcome)) => outcomes[index] = Some(outcome),
                    Err(err) => error!("fanout branch for {} aborted: {}", supervisor_id, err),
                }
            }

            let branches = channels
                .into_iter()
                .zip(outcomes)
                .map(|(channel, outcome)| {
                    let outcome = outcome
                        .unwrap_or_else(|| BranchOutcome::Failed("branch aborted".to_string()));
                    (channel, outcome)
                })
                .collect();
            FanoutReport {
                event_id: supervisor_id,
                persisted,
                branches,
            }
        });

        Launched {
            event_id,
            supervisor,
        }
    }

    /// Runs a one-off blocking send outside any event group, such as a
    /// rejection notice for a submission that was never persisted.
    pub fn spawn_detached(
        &self,
        name: &'static str,
        run: impl FnOnce() + Send + 'static,
    ) -> JoinHandle<()> {
        let guard = self.in_flight.enter();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let _guard = guard;
            if let Err(err) = runtime.spawn_blocking(run).await {
                error!("{} task failed: {}", name, describe_join_error(err));
            }
        })
    }
}

async fn run_branch(
    runtime: Handle,
    log: Arc<dyn DeliveryLog>,
    event_id: &str,
    branch: Branch,
    mut persist: watch::Receiver<PersistState>,
) -> BranchOutcome {
    let channel = branch.channel;
    let state = match persist
        .wait_for(|state| *state != PersistState::Pending)
        .await
    {
        Ok(state) => *state,
        Err(_) => PersistState::Failed,
    };
    if state != PersistState::Persisted {
        warn!(
            "skipping {} send for {}: event was not persisted",
            channel, event_id
        );
        return BranchOutcome::Skipped;
    }

    match runtime.spawn_blocking(branch.run).await {
        Ok(Ok(())) => {
            info!("{} send for {} finished", channel, event_id);
            BranchOutcome::Delivered
        }
        Ok(Err(err)) => {
            warn!("{} send for {} failed: {}", channel, event_id, err);
            BranchOutcome::Failed(err.to_string())
        }
        Err(err) => {
            let detail = describe_join_error(err);
            error!("{} send for {} panicked: {}", channel, event_id, detail);
            record_panic(log.as_ref(), event_id, channel, &detail);
            BranchOutcome::Panicked(detail)
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn record_panic(log: &dyn DeliveryLog, event_id: &str, channel: ChannelKind, detail: &str) {
    let now = Utc::now();
    let correlation_id = sha256_hex(&format!(
        "PANIC-{}\n{}\n{}",
        event_id,
        channel,
        now.timestamp_nanos_opt().unwrap_or_default()
    ));
    let detail_row = match channel {
        ChannelKind::Webhook => AttemptDetail::Webhook {
            endpoint: String::new(),
        },
        _ => AttemptDetail::Mail {
            sender: String::new(),
            from: String::new(),
            subject: String::new(),
            in_reply_to: None,
            recipients: Vec::new(),
        },
    };
    let attempt = NewAttempt {
        correlation_id: correlation_id.clone(),
        event_id: Some(event_id.to_string()),
        channel,
        payload: String::new(),
        created_at: now,
        detail: detail_row,
    };
    let message = format!("panic: {}", detail);
    let result = log
        .save_attempt(&attempt)
        .and_then(|()| log.record_outcome(&correlation_id, Some(&message)));
    if let Err(err) = result {
        warn!("failed to record panic of {} for {}: {}", channel, event_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::{received, web_submission};
    use crate::store::StoreError;
    use send_notifications_module::{AttemptStatus, DeliveryLogError};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct MemoryStore {
        fail: bool,
        saved: Mutex<Vec<String>>,
    }

    impl EventStore for MemoryStore {
        fn save_event(&self, event: &MessageEvent) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::InvalidValue("disk full".to_string()));
            }
            self.saved.lock().expect("lock").push(event.id.clone());
            Ok(())
        }

        fn find_by_external_message_id(
            &self,
            _message_id: &str,
        ) -> Result<Option<MessageEvent>, StoreError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct PanicLog {
        outcomes: Mutex<Vec<(ChannelKind, AttemptStatus, Option<String>)>>,
        channels: Mutex<Vec<(String, ChannelKind)>>,
    }

    impl DeliveryLog for PanicLog {
        fn save_attempt(&self, attempt: &NewAttempt) -> Result<(), DeliveryLogError> {
            self.channels
                .lock()
                .expect("lock")
                .push((attempt.correlation_id.clone(), attempt.channel));
            Ok(())
        }

        fn record_outcome(&self, id: &str, error: Option<&str>) -> Result<(), DeliveryLogError> {
            let channels = self.channels.lock().expect("lock");
            let channel = channels
                .iter()
                .find(|(saved, _)| saved == id)
                .map(|(_, channel)| *channel)
                .unwrap_or(ChannelKind::Email);
            self.outcomes.lock().expect("lock").push((
                channel,
                AttemptStatus::from_error(error),
                error.map(str::to_string),
            ));
            Ok(())
        }

        fn save_file_attempt(&self, _: &str, _: &str) -> Result<(), DeliveryLogError> {
            Ok(())
        }

        fn record_file_outcome(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<(), DeliveryLogError> {
            Ok(())
        }
    }

    fn fanout(fail: bool, log: Arc<PanicLog>) -> (Fanout, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore {
            fail,
            saved: Mutex::new(Vec::new()),
        });
        let fanout = Fanout::new(
            Handle::current(),
            store.clone(),
            log,
            Arc::new(InFlight::new()),
        );
        (fanout, store)
    }

    fn event() -> MessageEvent {
        MessageEvent::web(web_submission(), received())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn branches_run_after_persistence_and_report_independently() {
        let (fanout, store) = fanout(false, Arc::new(PanicLog::default()));
        let saved_store = store.clone();
        let saw_event = Arc::new(AtomicBool::new(false));
        let saw = saw_event.clone();
        let branches = vec![
            Branch::new(ChannelKind::Webhook, || Err("webhook down".into())),
            Branch::new(ChannelKind::Email, move || {
                saw.store(
                    !saved_store.saved.lock().expect("lock").is_empty(),
                    Ordering::SeqCst,
                );
                Ok(())
            }),
        ];

        let report = fanout.launch(event(), branches).finished().await.expect("report");

        assert!(report.persisted);
        assert!(saw_event.load(Ordering::SeqCst));
        assert_eq!(
            report.outcome(ChannelKind::Webhook),
            Some(&BranchOutcome::Failed("webhook down".to_string()))
        );
        assert_eq!(report.outcome(ChannelKind::Email), Some(&BranchOutcome::Delivered));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_persistence_skips_every_branch() {
        let (fanout, _store) = fanout(true, Arc::new(PanicLog::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let branches = [ChannelKind::Webhook, ChannelKind::Email, ChannelKind::ThankYou]
            .into_iter()
            .map(|channel| {
                let calls = calls.clone();
                Branch::new(channel, move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let report = fanout.launch(event(), branches).finished().await.expect("report");

        assert!(!report.persisted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(report
            .branches
            .iter()
            .all(|(_, outcome)| *outcome == BranchOutcome::Skipped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_branch_is_isolated_and_recorded() {
        let log = Arc::new(PanicLog::default());
        let (fanout, _store) = fanout(false, log.clone());
        let branches = vec![
            Branch::new(ChannelKind::Webhook, || panic!("boom")),
            Branch::new(ChannelKind::Email, || Ok(())),
        ];

        let report = fanout.launch(event(), branches).finished().await.expect("report");

        assert_eq!(
            report.outcome(ChannelKind::Webhook),
            Some(&BranchOutcome::Panicked("boom".to_string()))
        );
        assert_eq!(report.outcome(ChannelKind::Email), Some(&BranchOutcome::Delivered));
        let outcomes = log.outcomes.lock().expect("lock");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, ChannelKind::Webhook);
        assert_eq!(outcomes[0].1, AttemptStatus::Failed);
        assert_eq!(outcomes[0].2.as_deref(), Some("panic: boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn launch_returns_before_branches_finish() {
        let (fanout, _store) = fanout(false, Arc::new(PanicLog::default()));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let branches = vec![Branch::new(ChannelKind::Email, move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        })];

        let launched = fanout.launch(event(), branches);
        assert_eq!(fanout.in_flight().active(), 1);
        assert!(!fanout.in_flight().drain(Duration::from_millis(50)).await);

        release_tx.send(()).expect("release");
        assert!(fanout.in_flight().drain(Duration::from_secs(5)).await);
        let report = launched.finished().await.expect("report");
        assert_eq!(report.outcome(ChannelKind::Email), Some(&BranchOutcome::Delivered));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detached_sends_are_tracked() {
        let (fanout, _store) = fanout(false, Arc::new(PanicLog::default()));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        fanout
            .spawn_detached("rejection", move || flag.store(true, Ordering::SeqCst))
            .await
            .expect("join");
        assert!(ran.load(Ordering::SeqCst));
        assert!(fanout.in_flight().drain(Duration::from_millis(100)).await);
    }
}
