//! Error types for the cleaning pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum MetacleanError {
    /// Expected markup was missing from a catalogue page (site layout drift).
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Target file name already exists at a rename/move step.
    #[error("File already exists: {0}")]
    FileConflict(PathBuf),

    /// The EPUB could not be opened or parsed at all.
    #[error("Cannot read EPUB {path:?}: {message}")]
    UnrecoverableFile { path: PathBuf, message: String },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A batch position that holds no record.
    #[error("No record at position {0}")]
    UnknownRecord(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl MetacleanError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn network(url: &str, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn unrecoverable(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::UnrecoverableFile {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }

    /// Whether a retry could plausibly succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

impl From<std::io::Error> for MetacleanError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { path: None, source }
    }
}

impl From<serde_json::Error> for MetacleanError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<image::ImageError> for MetacleanError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MetacleanError>;
