//! Error taxonomy for document loading.
//!
//! Every failure that reaches a consumer is flattened into the human-readable
//! string carried by `DocumentEvent::LoadingFailed`; the typed variants exist so
//! the loading machine can decide which failures are fatal.

use thiserror::Error;

/// Failure reported by a `Transport` while fetching a resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransferError(pub String);

impl TransferError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that can end (or degrade) a load attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The resource could not be fetched.
    #[error("{0}")]
    Transfer(#[from] TransferError),

    /// No decoder claims the byte stream.
    #[error("Unrecognized image format")]
    FormatUnrecognized,

    /// A decoder was selected but failed while reading the stream.
    #[error("Failed to decode image: {0}")]
    Decode(String),
}

impl LoadError {
    /// Whether this error ends the current load attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LoadError::Decode(_))
    }
}

/// An orientation that has no pure-rotation equivalent.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum OrientationError {
    #[error("orientation {0} cannot be represented as a rotation angle")]
    Unsupported(u16),
}
