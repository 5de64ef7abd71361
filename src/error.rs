//! Error types for the registration engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = RegistrationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode or encode {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("frame {frame} is outside the sequence (length {len})")]
    FrameOutOfRange { frame: usize, len: usize },

    #[error("invalid frame range: {0}")]
    InvalidRange(String),

    #[error("point count mismatch: {0}")]
    PointCountMismatch(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("backup of original frames failed: {0}")]
    BackupFailed(String),

    #[error("failed to save {path:?}: {reason}")]
    SaveFailed { path: PathBuf, reason: String },

    #[error("accelerator unavailable: {0}")]
    Accelerator(String),

    #[error("registration cancelled before frame {0}")]
    Cancelled(usize),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RegistrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}
