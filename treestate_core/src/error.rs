//! Error types for treestate_core.

use thiserror::Error;

/// Result type alias using treestate_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, mutating or persisting a tree state.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred while reading or writing the store file.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Bytes at an offset do not form a well-formed block.
    #[error("Corrupt store at offset {offset}: {reason}")]
    CorruptStore { offset: u64, reason: String },

    /// A non-zero root id does not name a root record.
    #[error("Unknown root: {id}")]
    UnknownRoot { id: u64 },

    /// `copied` and the COPIED flag disagree.
    #[error("Invalid copy source: {reason}")]
    InvalidCopySource { reason: String },

    /// Metadata cannot be stored in a root record.
    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    /// Path is empty or has an empty component.
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Compressing a block failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },
}

impl Error {
    /// Create a CorruptStore error.
    pub fn corrupt_store(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptStore {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an UnknownRoot error.
    pub fn unknown_root(id: u64) -> Self {
        Error::UnknownRoot { id }
    }

    /// Create an InvalidCopySource error.
    pub fn invalid_copy_source(reason: impl Into<String>) -> Self {
        Error::InvalidCopySource {
            reason: reason.into(),
        }
    }

    /// Create an InvalidMetadata error.
    pub fn invalid_metadata(reason: impl Into<String>) -> Self {
        Error::InvalidMetadata {
            reason: reason.into(),
        }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: &[u8], reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: String::from_utf8_lossy(path).into_owned(),
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression_error(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Attach an offset to a decoding failure.
    ///
    /// Payload decoders work on in-memory slices and report truncation as
    /// `UnexpectedEof`; at the block boundary that is corruption, not I/O.
    pub(crate) fn at_offset(self, offset: u64) -> Self {
        match self {
            Error::Io { source } if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::corrupt_store(offset, "truncated payload")
            }
            Error::CorruptStore { reason, .. } => Error::CorruptStore { offset, reason },
            other => other,
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}
