use std::sync::Arc;

use parking_lot::Mutex;

use crate::id::TimeoutId;
use crate::TimeoutHandle;

/// A unit of work dispatched when a timeout fires. Mirrors the
/// `Handler<Long>` shape of the original platform's timer API: the
/// callback receives the handle of the timeout that fired so it can, for
/// a periodic timeout, later call `Timer::remove` on it.
pub trait TimerTask: Send {
    fn run(&mut self, handle: TimeoutHandle);
}

impl<F> TimerTask for F
where
    F: FnMut(TimeoutHandle) + Send,
{
    fn run(&mut self, handle: TimeoutHandle) {
        self(handle)
    }
}

pub(crate) type SharedTask = Arc<Mutex<Box<dyn TimerTask>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Init,
    Expired,
    Cancelled,
}

/// A single scheduled timeout living in a wheel bucket. Periodic
/// timeouts keep `delay_ms > 0`; one-shot timeouts have `delay_ms == 0`.
pub struct Timeout {
    pub id: TimeoutId,
    pub deadline_ms: i64,
    pub delay_ms: i64,
    pub slot_index: usize,
    pub state: TimeoutState,
    pub(crate) task: SharedTask,
}

impl Timeout {
    pub fn is_periodic(&self) -> bool {
        self.delay_ms > 0
    }

    pub fn handle(&self) -> TimeoutHandle {
        TimeoutHandle {
            id: self.id,
            periodic: self.is_periodic(),
        }
    }
}

/// One firing produced by `TimerWorker::expired`. Carries a shared
/// reference to the user task so the `Timer` facade can dispatch it
/// without needing to own the (possibly still wheel-resident, for
/// periodic timeouts) `Timeout` itself.
pub struct Fired {
    pub id: TimeoutId,
    pub periodic: bool,
    pub(crate) task: SharedTask,
}

impl Fired {
    /// Invokes the user task, catching (and letting the caller log) any
    /// panic so a misbehaving task never brings down the worker loop.
    pub fn dispatch(&self) -> std::thread::Result<()> {
        let task = Arc::clone(&self.task);
        let handle = TimeoutHandle {
            id: self.id,
            periodic: self.periodic,
        };
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            task.lock().run(handle);
        }))
    }
}
