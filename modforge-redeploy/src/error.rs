use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedeployError {
    #[error("failed to watch directory: {0}")]
    Watch(#[from] notify::Error),

    #[error("redeploy engine already closed")]
    AlreadyClosed,

    #[error("failed to start scan timer: {0}")]
    Timer(#[from] modforge_timer::TimerError),
}

pub type RedeployResult<T> = std::result::Result<T, RedeployError>;
