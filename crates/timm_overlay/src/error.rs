//! Error types for mount operations.
//!
//! All fallible functions in this crate return [`Result<T>`], which uses [`Error`]
//! as the error type. Per-path link failures are collected into
//! [`Error::Incomplete`] instead of aborting the batch they occurred in.

use crate::path::VirtualPath;
use camino::Utf8PathBuf;
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mounting, unmounting or inspecting the overlay.
#[derive(Error, Debug)]
pub enum Error {
    /// A content source's root directory is missing. Raised before any link is touched.
    #[error("Content source '{id}' is unavailable: {root} does not exist")]
    SourceUnavailable { id: String, root: Utf8PathBuf },

    /// The persisted manifest could not be parsed or failed validation.
    #[error("Manifest {path} is corrupt: {reason}")]
    CorruptManifest { path: Utf8PathBuf, reason: String },

    /// The OS refused to create a link (usually missing symlink privileges).
    #[error("Permission denied while linking {path}: {source}")]
    LinkPermissionDenied {
        path: VirtualPath,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure while linking or unlinking a single path.
    #[error("Failed to link {path}: {source}")]
    LinkFailure {
        path: VirtualPath,
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be persisted. Disk and manifest now disagree.
    #[error("Failed to write manifest {path}: {source}")]
    WriteFailure {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No source record with this id exists in the manifest.
    #[error("Content source not found: {0}")]
    SourceNotFound(String),

    /// The source is still mounted and cannot be removed.
    #[error("Content source '{0}' is mounted; unmount it first")]
    SourceMounted(String),

    /// A source id is empty, reserved or not a valid slug.
    #[error("Invalid content source id: {0}")]
    InvalidSourceId(String),

    /// A path is absolute, empty or escapes its root.
    #[error("Invalid virtual path '{path}': {reason}")]
    InvalidVirtualPath { path: String, reason: &'static str },

    /// Another mount or unmount operation currently holds the manifest lock.
    #[error("Another operation is in progress (lock held on {0})")]
    Locked(Utf8PathBuf),

    /// The operation was cancelled; `applied` path steps were persisted.
    #[error("Operation cancelled after {applied}/{total} paths")]
    Cancelled { applied: usize, total: usize },

    /// One or more per-path steps failed; everything else was applied and persisted.
    #[error("{operation} finished with {} failed path(s)", failures.len())]
    Incomplete {
        operation: Operation,
        failures: Vec<PathFailure>,
    },

    /// Filesystem I/O failed outside of a single path step.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify an I/O error raised while materializing `path`.
    pub fn link(path: &VirtualPath, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Error::LinkPermissionDenied {
                path: path.clone(),
                source,
            }
        } else {
            Error::LinkFailure {
                path: path.clone(),
                source,
            }
        }
    }

    pub(crate) fn corrupt(path: &camino::Utf8Path, reason: impl Into<String>) -> Self {
        Error::CorruptManifest {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// The engine operation an error or progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Mount,
    Unmount,
    MountBase,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Mount => "mount",
            Operation::Unmount => "unmount",
            Operation::MountBase => "base content mount",
        })
    }
}

/// A single path step that failed during an operation.
#[derive(Debug)]
pub struct PathFailure {
    pub path: VirtualPath,
    /// Either [`Error::LinkPermissionDenied`] or [`Error::LinkFailure`].
    pub error: Error,
}

impl fmt::Display for PathFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}
