//! Hashed-wheel timer for the modforge runtime.
//!
//! An approximate, O(1)-amortized timer wheel: fixed-size circular array
//! of buckets, a single owner thread (or event-loop thread) advancing a
//! tick counter, and id-based cancellation that never needs to touch a
//! lock on the hot path. Exact sub-tick firing is out of scope by design
//! — callers get "within one tick of the deadline."

mod bucket;
mod error;
mod event_loop;
mod id;
mod task;
mod timer;
mod wheel;
mod worker;

pub use error::{TimerError, TimerResult};
pub use event_loop::EventLoop;
pub use id::{TimeoutHandle, TimeoutId};
pub use task::{Fired, Timeout, TimeoutState, TimerTask};
pub use timer::Timer;
pub use wheel::Wheel;
pub use worker::TimerWorker;
pub use bucket::Bucket;
