use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network failed {0}")]
    Network(#[from] reqwest::Error),
    #[error("parse failed {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io failed {0}")]
    Io(#[from] std::io::Error),
    #[error("playlist failed: {0}")]
    Playlist(String),
    #[error("http status {0} for {1}")]
    HttpStatus(u16, String),
    #[error("failed integrity check")]
    IntegrityCheck,
    #[error("task not found: {0}")]
    TaskNotFound(u64),
    #[error("channel err: {0}")]
    Channel(String),
    #[error("future err: {0}")]
    Future(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the host scheduler should re-enqueue the job with backoff.
    /// Local task state stays valid for resume in either case.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::HttpStatus(..) | Error::IntegrityCheck
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
