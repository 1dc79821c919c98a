/// Error types for every failure domain of the library
///
/// Scan-level errors abort a reconciliation cycle. Metadata and thumbnail
/// errors are per-file and never escape a cycle. Persistence errors are
/// returned to the caller so the write can be re-issued.
use std::path::PathBuf;
use thiserror::Error;

/// A scan could not produce a result at all
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("folder not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied reading {}", .0.display())]
    Access(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    /// Classify an I/O error raised while opening the scan root
    pub(crate) fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => ScanError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => ScanError::Access(path),
            _ => ScanError::Io { path, source },
        }
    }
}

/// Timestamps for a single file could not be read
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("cannot stat {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable timestamp for {}", .0.display())]
    NoTimestamp(PathBuf),
}

/// Thumbnail derivation failed for a single file
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("{} is not an image", .0.display())]
    NotAnImage(PathBuf),

    #[error("cannot decode {}: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("thumbnail I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The catalog database rejected a read or write
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("catalog connection lock poisoned")]
    Poisoned,

    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("cannot create catalog directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by reconciliation controller operations
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("reconciliation worker has stopped")]
    Stopped,
}
