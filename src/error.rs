use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migration to schema version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Attaches an operation description to a rusqlite failure.
pub trait SqliteContext<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, StoreError>;
    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T, StoreError>;
}

impl<T> SqliteContext<T> for Result<T, rusqlite::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Sqlite {
            context: context.into(),
            source,
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Sqlite {
            context: f().into(),
            source,
        })
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device {target}: {reason}")]
    Device { target: String, reason: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Failures surfaced by the scan lifecycle. Cancellation never maps to one of these.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("a scan is already in progress")]
    AlreadyScanning,
    #[error("campaign '{name}' could not be resolved: {source}")]
    Campaign {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("enrichment failed: {0}")]
    Enrichment(String),
    #[error("saving results for campaign {campaign_id} failed: {source}")]
    Persistence {
        campaign_id: i64,
        #[source]
        source: StoreError,
    },
    #[error("data directory: {0}")]
    DataDirectory(String),
    #[error("scan task failed: {0}")]
    TaskFailed(String),
}
