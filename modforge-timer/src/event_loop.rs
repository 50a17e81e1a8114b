use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::worker::TimerWorker;

/// The contract surface a real event loop plugs a `TimerWorker` into
/// (spec.md §4.3 mode B): the loop's blocking wait is clamped to
/// `min(default_timeout, max(0, worker.sleep_time()))`, and its
/// post-select callback runs `expired()` and dispatches tasks, all on
/// the loop's own thread. Networked selector I/O itself is out of
/// scope; this is the minimal reactor needed to exercise that hook
/// without a real network stack.
pub struct EventLoop {
    worker: TimerWorker,
    default_timeout: Duration,
    start: Instant,
}

impl EventLoop {
    pub fn new(worker: TimerWorker, default_timeout: Duration) -> Self {
        EventLoop {
            worker,
            default_timeout,
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// The wait duration this tick's "select" step should block for.
    pub fn wait_timeout(&self) -> Duration {
        let sleep_ms = self.worker.sleep_time_ms(self.now_ms()).max(0);
        Duration::from_millis(sleep_ms as u64).min(self.default_timeout)
    }

    /// Runs one iteration of the loop: waits up to `wait_timeout()`
    /// (standing in for the selector wait), then sweeps expirations and
    /// dispatches every task that fired.
    pub fn run_once(&mut self) {
        let wait = self.wait_timeout();
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        for fired in self.worker.expired(self.now_ms()) {
            if fired.dispatch().is_err() {
                warn!(id = fired.id.raw(), "timer task panicked");
            }
        }
    }

    pub fn worker_mut(&mut self) -> &mut TimerWorker {
        &mut self.worker
    }

    pub fn into_worker(self) -> TimerWorker {
        debug!("event loop detaching from timer worker");
        self.worker
    }
}
