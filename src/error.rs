use crate::models::Cursor;

/// Errors produced by the transfer core and the API glue.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{endpoint} returned status {status}: {body}")]
    Protocol {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// An append or finish failed; the upload can continue from `cursor`.
    #[error("upload session {} interrupted at offset {}: {source}", cursor.session_id, cursor.offset)]
    SessionInterrupted {
        cursor: Cursor,
        #[source]
        source: Box<TransferError>,
    },

    #[error("upload offset mismatch: local {local}, server {server}")]
    OffsetMismatch { local: u64, server: u64 },

    #[error("content hash mismatch for {path}: local {local}, remote {remote}")]
    HashMismatch {
        path: String,
        local: String,
        remote: String,
    },

    #[error("invalid upload session state: {0}")]
    InvalidState(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("external command failed: {0}")]
    Command(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}

impl TransferError {
    /// HTTP status for protocol errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Protocol { status, .. } => Some(*status),
            TransferError::SessionInterrupted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(_) => true,
            TransferError::Protocol { status, .. } => *status == 429 || *status >= 500,
            TransferError::SessionInterrupted { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
