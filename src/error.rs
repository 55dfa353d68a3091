use std::fmt;

/// Errors reported by a [`BucketStore`](crate::store::BucketStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("etag conflict on {bucket}/{key}: expected {expected}, found {}", .actual.as_deref().unwrap_or("<absent>"))]
    EtagConflict {
        bucket: String,
        key: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Timeouts, dropped connections and other conditions a retry may clear.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::BucketNotFound(_))
    }

    pub fn is_etag_conflict(&self) -> bool {
        matches!(self, StoreError::EtagConflict { .. })
    }
}

/// Errors raised while rebuilding a domain entity from a stored record.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{key}: missing field '{field}'")]
    MissingField { key: String, field: &'static str },

    #[error("{key}: invalid field '{field}': {reason}")]
    InvalidField {
        key: String,
        field: &'static str,
        reason: String,
    },

    #[error("{key}: unknown schema version {version}")]
    UnknownVersion { key: String, version: u32 },

    #[error("{key}: model wrote schema marker {written:?}, bucket expects {expected}")]
    StaleMarker {
        key: String,
        written: Option<u32>,
        expected: u32,
    },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A fatal failure inside one pipeline step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: StoreError,
    },
}

/// The pipeline step a bucket was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Upgrade,
    Reindex,
    MigrateRecords,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Upgrade => "upgrade",
            StepKind::Reindex => "reindex",
            StepKind::MigrateRecords => "migrate_records",
        })
    }
}

/// Fatal migration error, annotated with the bucket and step that failed.
#[derive(Debug, thiserror::Error)]
#[error("bucket {bucket}: {step} failed: {source}")]
pub struct MigrateError {
    pub bucket: String,
    pub step: StepKind,
    #[source]
    pub source: StepError,
}

/// Process-level error for the migrator binary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),
}

impl AppError {
    /// Short machine-readable tag, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Toml(_) => "toml",
            AppError::Store(_) => "store",
            AppError::Migrate(_) => "migrate",
        }
    }
}
