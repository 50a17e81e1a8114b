use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{TimerError, TimerResult};
use crate::id::TimeoutId;
use crate::task::{SharedTask, Timeout};
use crate::worker::TimerWorker;
use crate::{TimerTask, TimeoutHandle};

/// Bounded event-queue capacity (spec.md §4.3): producers block on full,
/// which keeps the queue either empty or full rather than growing
/// unboundedly ahead of the worker thread.
const EVENT_QUEUE_CAPACITY: usize = 16;

enum TimerEvent {
    Schedule {
        deadline_ms: i64,
        delay_ms: i64,
        task: SharedTask,
        reply: mpsc::Sender<TimeoutHandle>,
    },
    Cancel {
        id: TimeoutId,
        periodic: bool,
    },
    Shutdown,
}

/// Public facade over a `TimerWorker` running on its own dedicated
/// thread (spec.md §4.3 mode A). `schedule`/`remove` calls from any
/// other thread are serialized through a bounded channel; the worker
/// consumes it one event at a time, so no timer state is ever touched
/// from two threads at once.
pub struct Timer {
    tx: SyncSender<TimerEvent>,
    join: Option<JoinHandle<Vec<Timeout>>>,
    worker_thread: ThreadId,
    start: Instant,
}

impl Timer {
    pub fn start(tick_duration: Duration, capacity: usize) -> TimerResult<Self> {
        let tick_ms = tick_duration.as_millis() as i64;
        let start = Instant::now();
        let worker = TimerWorker::new(tick_ms, capacity, 0)?;

        let (tx, rx) = mpsc::sync_channel::<TimerEvent>(EVENT_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel::<ThreadId>();

        let join = thread::Builder::new()
            .name("modforge-timer".to_string())
            .spawn(move || {
                let _ = ready_tx.send(thread::current().id());
                run_worker_loop(worker, rx, start)
            })
            .map_err(|e| TimerError::WorkerPanicked(e.to_string()))?;

        let worker_thread = ready_rx
            .recv()
            .map_err(|e| TimerError::WorkerPanicked(e.to_string()))?;

        Ok(Timer {
            tx,
            join: Some(join),
            worker_thread,
            start,
        })
    }

    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Schedules a one-shot task to run after `delay`.
    pub fn one_shot(&self, delay: Duration, task: impl TimerTask + 'static) -> TimeoutHandle {
        let deadline_ms = self.now_ms() + delay.as_millis() as i64;
        self.schedule_raw(deadline_ms, 0, Arc::new(Mutex::new(Box::new(task))))
    }

    /// Schedules a task that repeats every `period` until cancelled.
    pub fn periodic(&self, period: Duration, task: impl TimerTask + 'static) -> TimeoutHandle {
        let period_ms = period.as_millis() as i64;
        let deadline_ms = self.now_ms() + period_ms;
        self.schedule_raw(deadline_ms, period_ms, Arc::new(Mutex::new(Box::new(task))))
    }

    fn schedule_raw(&self, deadline_ms: i64, delay_ms: i64, task: SharedTask) -> TimeoutHandle {
        let (reply, reply_rx) = mpsc::channel();
        let _ = self.tx.send(TimerEvent::Schedule {
            deadline_ms,
            delay_ms,
            task,
            reply,
        });
        reply_rx
            .recv()
            .expect("worker thread dropped the reply channel")
    }

    pub fn remove(&self, handle: TimeoutHandle) {
        let _ = self.tx.send(TimerEvent::Cancel {
            id: handle.id,
            periodic: handle.periodic,
        });
    }

    /// Stops the timer, joining its thread and returning every timeout
    /// still resident in the wheel. May not be called from within a
    /// task dispatched by this timer's own worker thread.
    pub fn stop(mut self) -> TimerResult<Vec<Timeout>> {
        if thread::current().id() == self.worker_thread {
            return Err(TimerError::StopFromTask);
        }
        let _ = self.tx.send(TimerEvent::Shutdown);
        let join = self.join.take().expect("stop() consumes the Timer");
        join.join()
            .map_err(|e| TimerError::WorkerPanicked(format!("{e:?}")))
    }
}

fn run_worker_loop(mut worker: TimerWorker, rx: Receiver<TimerEvent>, start: Instant) -> Vec<Timeout> {
    info!("timer worker thread started");
    loop {
        let now_ms = start.elapsed().as_millis() as i64;
        let sleep_ms = worker.sleep_time_ms(now_ms).max(0) as u64;

        match rx.recv_timeout(Duration::from_millis(sleep_ms)) {
            Ok(event) => {
                if apply_event(&mut worker, event) {
                    break;
                }
                // Drain whatever else is already queued before sleeping again.
                while let Ok(event) = rx.try_recv() {
                    if apply_event(&mut worker, event) {
                        return worker.drain_all();
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let now_ms = start.elapsed().as_millis() as i64;
                for fired in worker.expired(now_ms) {
                    if let Err(panic) = fired.dispatch() {
                        error!(id = fired.id.raw(), ?panic, "timer task panicked; continuing");
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("timer event queue disconnected without a shutdown event");
                break;
            }
        }
    }
    worker.drain_all()
}

/// Returns true when the loop should stop.
fn apply_event(worker: &mut TimerWorker, event: TimerEvent) -> bool {
    match event {
        TimerEvent::Schedule {
            deadline_ms,
            delay_ms,
            task,
            reply,
        } => {
            let handle = worker.schedule(deadline_ms, delay_ms, task);
            let _ = reply.send(handle);
            false
        }
        TimerEvent::Cancel { id, periodic } => {
            worker.remove_by_id(id, periodic);
            false
        }
        TimerEvent::Shutdown => {
            info!("timer worker received shutdown");
            true
        }
    }
}
