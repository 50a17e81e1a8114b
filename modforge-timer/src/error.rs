use thiserror::Error;

/// Errors raised while configuring or driving the timer wheel.
#[derive(Error, Debug)]
pub enum TimerError {
    #[error("wheel capacity must be greater than zero")]
    ZeroCapacity,

    #[error("tick_duration_ms * capacity overflows a signed 63-bit range")]
    SpanOverflow,

    #[error("timer worker thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("stop() called from within a firing task")]
    StopFromTask,
}

pub type TimerResult<T> = std::result::Result<T, TimerError>;
