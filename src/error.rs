//! Error taxonomy shared by the store and its backends

use thiserror::Error;

use crate::item::ValueType;

/// Errors surfaced by typed values, the store and persistence backends.
///
/// Only metadata and backend failures are ever hard errors; malformed value
/// payloads fall back to the caller's default instead.
#[derive(Debug, Error)]
pub enum CfgError {
    /// A value's kind disagrees with the entry's established type
    #[error("type mismatch for '{key}': stored as {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: ValueType,
        actual: ValueType,
    },

    /// Malformed metadata or wire record
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Durable storage could not be read or written
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The object was never registered with the store
    #[error("object is not registered")]
    NotRegistered,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode/decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl CfgError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidEncoding(message.into())
    }

    /// True for failures of the underlying storage rather than of the data
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Io(_))
    }
}

impl From<quick_xml::events::attributes::AttrError> for CfgError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::InvalidEncoding(err.to_string())
    }
}

impl From<quick_xml::escape::EscapeError> for CfgError {
    fn from(err: quick_xml::escape::EscapeError) -> Self {
        Self::InvalidEncoding(err.to_string())
    }
}

impl From<std::str::Utf8Error> for CfgError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::InvalidEncoding(err.to_string())
    }
}

pub type Result<T, E = CfgError> = std::result::Result<T, E>;
