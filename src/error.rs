use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("cannot read {}: {source}", path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed repository line: {line}")]
    Parse { line: String },
    #[error("neither InRelease nor Release.gpg could be fetched from {url}")]
    MetadataUnavailable { url: String },
    #[error("no signing key id found in signature data from {url}")]
    KeyIdNotFound { url: String },
    #[error("failed to download key {key}: {reason}")]
    KeyDownloadFailed { key: String, reason: String },
    #[error("key {key} expired on {}", expired_at.format("%Y-%m-%d %H:%M:%S UTC"))]
    KeyExpired {
        key: String,
        expired_at: DateTime<Utc>,
    },
    #[error("{tool} failed: {reason}")]
    Tool { tool: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}
