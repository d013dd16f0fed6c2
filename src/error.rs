//! Error taxonomy for the monitor.
//!
//! Each component returns its own `thiserror` enum so callers can match on the
//! kind that matters to them:
//!
//! - **`IngestError`**: a rejected `POST /api/data`. `MalformedInput` and
//!   `InvalidFormat` are local to the request (400); `Storage` means the
//!   durable log write failed (500) and the cache was left untouched.
//! - **`StorageError`**: the log or a recording file could not be written.
//! - **`FetchError`**: the monitor could not get a reading from the server.
//!   Always recovered inside the poll loop.
//! - **`RecorderError`**: an invalid recorder transition or a failed flush.
//!
//! "Nothing recorded" is not an error; see `recorder::StopOutcome`.

use std::path::PathBuf;

use thiserror::Error;

/// Why an ingest request was rejected.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid data format: `{field}` is not a finite number")]
    InvalidFormat { field: &'static str },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Stable kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MalformedInput(_) => "malformed_input",
            IngestError::InvalidFormat { .. } => "invalid_format",
            IngestError::Storage(_) => "storage_failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io { path: path.into(), source }
    }

    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StorageError::Csv { path: path.into(), source }
    }
}

/// Network failure while polling the server.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server at {url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub(crate) fn from_request(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else {
            FetchError::Transport { url: url.to_string(), source }
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("already recording")]
    AlreadyRecording,

    #[error("failed to save recording ({buffered} readings kept for retry): {source}")]
    Storage {
        buffered: usize,
        #[source]
        source: StorageError,
    },
}
