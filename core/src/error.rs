use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("segment {index} rejected with status {status}")]
    Rejected { index: usize, status: u16 },
    #[error("segment {index} size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("segment {index}: last attempt failed after {attempts} attempts: {cause}")]
    LastAttemptFailed {
        index: usize,
        attempts: u32,
        cause: Box<CoreError>,
    },
    #[error("merge error: {0}")]
    Merge(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("download canceled")]
    Canceled,
}

impl CoreError {
    /// Failures worth another attempt at the same segment.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Network(_)
                | CoreError::Io(_)
                | CoreError::Rejected { .. }
                | CoreError::SizeMismatch { .. }
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        CoreError::InvalidState(format!("{} lock poisoned", what))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
