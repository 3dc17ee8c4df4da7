//! Error type shared by every engine component

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the buffer engine.
///
/// Decode problems never show up here: malformed byte sequences are replaced
/// with U+FFFD while reading.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Opening or mapping a file failed
    #[error("failed to open {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An offset or length points past the end of the addressed content
    #[error("offset {offset} is out of range (length {len})")]
    OutOfRange { offset: u64, len: u64 },

    /// The requested line has not been reached by the background index yet
    #[error("line {line} has not been indexed yet")]
    Pending { line: usize },

    /// The indexing worker could not be started or stopped abnormally
    #[error("index worker failed: {0}")]
    Worker(String),

    /// A search or token pattern failed to compile
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Writing buffer contents to a sink failed
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

impl EngineError {
    pub(crate) fn out_of_range(offset: usize, len: usize) -> Self {
        Self::OutOfRange {
            offset: offset as u64,
            len: len as u64,
        }
    }

    /// True for errors that go away once indexing has progressed further
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
