use thiserror::Error;

#[derive(Debug, Error)]
pub enum MsgrError {
    #[error("messenger thread already started")]
    AlreadyStarted,

    #[error("messenger is not running")]
    NotRunning,

    #[error("listen must be configured before start")]
    ListenAfterStart,

    #[error("transactor limit reached ({0} live)")]
    TranLimit(usize),

    #[error("pool has been cancelled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
