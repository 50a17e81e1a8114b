use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result of awaiting an `ActionFuture`. Deliberately not a nullable
/// return — the source's `ActionFuture.get` overloaded `null` for both
/// "timed out" and absence of a value, which this keeps apart
/// (spec.md §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome<T, E> {
    Pending,
    Ok(T),
    Err(E),
    TimedOut,
}

struct Latch<T, E> {
    result: Mutex<Option<Result<T, E>>>,
    cond: Condvar,
}

/// A one-shot latched future: a caller awaits it with a bounded
/// timeout, a producer completes it exactly once (spec.md §5:
/// "a one-shot latched future that a caller may await with a timeout").
pub struct ActionFuture<T, E> {
    latch: Arc<Latch<T, E>>,
}

/// The producer half, handed to whoever runs the blocking work.
pub struct ActionCompleter<T, E> {
    latch: Arc<Latch<T, E>>,
}

impl<T, E> ActionFuture<T, E> {
    pub fn new_pair() -> (ActionFuture<T, E>, ActionCompleter<T, E>) {
        let latch = Arc::new(Latch {
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            ActionFuture {
                latch: latch.clone(),
            },
            ActionCompleter { latch },
        )
    }

    /// Current state without blocking.
    pub fn poll(&self) -> ActionOutcome<T, E>
    where
        T: Clone,
        E: Clone,
    {
        match &*self.latch.result.lock().unwrap() {
            None => ActionOutcome::Pending,
            Some(Ok(v)) => ActionOutcome::Ok(v.clone()),
            Some(Err(e)) => ActionOutcome::Err(e.clone()),
        }
    }

    /// Blocks the calling thread until completed or `timeout` elapses.
    pub fn await_result(&self, timeout: Duration) -> ActionOutcome<T, E>
    where
        T: Clone,
        E: Clone,
    {
        let guard = self.latch.result.lock().unwrap();
        let (guard, timeout_result) = self
            .latch
            .cond
            .wait_timeout_while(guard, timeout, |r| r.is_none())
            .unwrap();

        match &*guard {
            Some(Ok(v)) => ActionOutcome::Ok(v.clone()),
            Some(Err(e)) => ActionOutcome::Err(e.clone()),
            None if timeout_result.timed_out() => ActionOutcome::TimedOut,
            None => ActionOutcome::Pending,
        }
    }
}

impl<T, E> ActionCompleter<T, E> {
    /// Completes the latch. A second call is a no-op: a latch fires
    /// exactly once.
    pub fn complete(&self, result: Result<T, E>) {
        let mut guard = self.latch.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(result);
            self.latch.cond.notify_all();
        }
    }
}

/// Replaces the source's per-deployment aggregate handler (spec.md §9):
/// an atomic counter plus a one-shot completion sink. The first failure
/// sets a sticky bit; the last arrival invokes the handler exactly
/// once, reporting overall success only if every completion succeeded.
pub struct CountingCompletionHandler {
    remaining: AtomicUsize,
    failed: AtomicBool,
    handler: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
}

impl CountingCompletionHandler {
    pub fn new(count: usize, handler: impl FnOnce(bool) + Send + 'static) -> Arc<Self> {
        Arc::new(CountingCompletionHandler {
            remaining: AtomicUsize::new(count),
            failed: AtomicBool::new(false),
            handler: Mutex::new(Some(Box::new(handler))),
        })
    }

    /// Reports one completion. `success=false` is sticky: once any
    /// completion fails, the final handler call reports overall failure
    /// regardless of later successes.
    pub fn complete_one(&self, success: bool) {
        if !success {
            self.failed.store(true, Ordering::SeqCst);
        }
        let prev_remaining = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if prev_remaining == 1 {
            if let Some(handler) = self.handler.lock().unwrap().take() {
                handler(!self.failed.load(Ordering::SeqCst));
            }
        }
    }
}

/// Submits blocking work (file I/O, module install, deploy/undeploy)
/// onto the worker pool and hands the caller back a latched future
/// (spec.md §5: "Asynchronous APIs wrap the blocking work in a
/// 'blocking action' submitted to the worker pool").
pub struct BlockingActionRunner;

impl BlockingActionRunner {
    pub fn spawn<T, E, F>(f: F) -> ActionFuture<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (future, completer) = ActionFuture::new_pair();
        tokio::task::spawn_blocking(move || {
            completer.complete(f());
        });
        future
    }
}
