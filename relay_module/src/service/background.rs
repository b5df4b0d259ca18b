use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::rate_limit::RateLimits;

const STOP_CHECK_SLICE: Duration = Duration::from_millis(250);

/// Stop flag and join handles of the service's background threads.
pub struct BackgroundControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Default for BackgroundControl {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundControl {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub(super) fn spawn(&mut self, run: impl FnOnce(Arc<AtomicBool>) + Send + 'static) {
        let stop = self.stop.clone();
        self.handles.push(thread::spawn(move || run(stop)));
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }
}

/// Sleeps up to `total`, waking every slice to check `stop`. Returns
/// `false` when stopped early.
pub(super) fn pause(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_CHECK_SLICE.min(deadline - now));
    }
    false
}

pub(super) fn slice(remaining: Duration) -> Duration {
    STOP_CHECK_SLICE.min(remaining)
}

pub(super) fn start_rate_sweeper(
    control: &mut BackgroundControl,
    limits: Arc<RateLimits>,
    period: Duration,
) {
    control.spawn(move |stop| {
        info!("rate counter sweep every {:?}", period);
        while pause(period, &stop) {
            let evicted = limits.sweep();
            if evicted > 0 {
                debug!("evicted {} expired rate counter(s)", evicted);
            }
        }
    });
}
