use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

impl StoreError {
    /// Connectivity failures are worth retrying; command and reply errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is shut down")]
    ShutDown,

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
