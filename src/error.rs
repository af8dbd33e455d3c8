use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures talking to the execution backend.
///
/// A runtime fault inside user code is not one of these: it comes back as an
/// `Output::Error` record.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend did not answer within {after:?}")]
    Timeout { after: Duration },

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed backend payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend session is not open")]
    NotOpen,

    #[error("request was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("cache store {path} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache store {path} is locked by another run")]
    Locked { path: PathBuf },
}

/// Errors that abort a weaving run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chunk {chunk} timed out after {after:?}")]
    Timeout { chunk: u32, after: Duration },

    #[error(transparent)]
    CacheStore(#[from] CacheStoreError),

    #[error("backend failed on chunk {chunk}: {source}")]
    Backend {
        chunk: u32,
        #[source]
        source: BackendError,
    },

    #[error("could not open backend session: {0}")]
    Session(#[source] BackendError),

    #[error("cannot read chunk source file {path}: {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn from_backend(chunk: u32, err: BackendError) -> Self {
        match err {
            BackendError::Timeout { after } => EngineError::Timeout { chunk, after },
            source => EngineError::Backend { chunk, source },
        }
    }
}
