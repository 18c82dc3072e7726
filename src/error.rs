// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy surfaced to callers.
//!
//! Every [`DocError`] maps onto a structured [`ErrorPayload`]
//! (`{status, name, message, error: true, reason?}`) so a façade layer can
//! hand it to clients unchanged.
//!
//! # Example
//!
//! ```
//! use doc_engine::DocError;
//!
//! let err = DocError::RevConflict { id: "a".into() };
//! let payload = err.to_payload();
//! assert_eq!(payload.status, 409);
//! assert_eq!(payload.name, "conflict");
//! assert!(payload.error);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Crate-wide result alias.
pub type Result<T, E = DocError> = std::result::Result<T, E>;

/// Errors produced by document, changes and view operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocError {
    /// Document payload is not a key/value mapping.
    #[error("Document must be a JSON object")]
    NotAnObject,

    /// `_id` has the wrong type, or an id-related field was misused.
    #[error("_id field must contain a string")]
    InvalidId { reason: Option<String> },

    /// `_id` absent or empty.
    #[error("_id is required for puts")]
    MissingId,

    /// Leading underscore outside the recognized reserved forms.
    #[error("Only reserved document ids may start with underscore.")]
    ReservedId { id: String },

    /// Supplied rev is not a current leaf of the document.
    #[error("Document update conflict")]
    RevConflict { id: String },

    #[error("Invalid rev format")]
    InvalidRev { reason: String },

    /// Target does not exist, its winner is deleted, or the revision body is gone.
    #[error("missing")]
    MissingDoc { reason: String },

    #[error("Missing JSON list of 'docs'")]
    MissingBulkDocs,

    /// Reserved key misuse in a document body.
    #[error("Bad special document member")]
    DocValidation { reason: String },

    /// Rejected by a caller-supplied validation hook.
    #[error("Forbidden by design document validate_doc_update function")]
    Forbidden { reason: String },

    #[error("Invalid query")]
    QueryParse { reason: String },

    #[error("Database is not open")]
    DatabaseClosed,

    #[error("Storage backend failure: {0}")]
    Backend(#[from] StorageError),
}

impl DocError {
    pub(crate) fn missing() -> Self {
        Self::MissingDoc { reason: "missing".into() }
    }

    pub(crate) fn deleted() -> Self {
        Self::MissingDoc { reason: "deleted".into() }
    }

    pub(crate) fn query(reason: impl Into<String>) -> Self {
        Self::QueryParse { reason: reason.into() }
    }

    /// HTTP-class status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NotAnObject
            | Self::InvalidId { .. }
            | Self::ReservedId { .. }
            | Self::InvalidRev { .. }
            | Self::MissingBulkDocs
            | Self::DocValidation { .. }
            | Self::QueryParse { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::MissingDoc { .. } => 404,
            Self::RevConflict { .. } => 409,
            Self::MissingId | Self::DatabaseClosed => 412,
            Self::Backend(_) => 500,
        }
    }

    /// Short machine-readable error name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotAnObject
            | Self::ReservedId { .. }
            | Self::InvalidRev { .. }
            | Self::MissingBulkDocs => "bad_request",
            Self::InvalidId { .. } => "invalid_id",
            Self::MissingId => "missing_id",
            Self::RevConflict { .. } => "conflict",
            Self::MissingDoc { .. } => "not_found",
            Self::DocValidation { .. } => "doc_validation",
            Self::Forbidden { .. } => "forbidden",
            Self::QueryParse { .. } => "query_parse_error",
            Self::DatabaseClosed => "database_closed",
            Self::Backend(_) => "internal_server_error",
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::InvalidId { reason } => reason.clone(),
            Self::ReservedId { id } => Some(id.clone()),
            Self::RevConflict { id } => Some(id.clone()),
            Self::InvalidRev { reason }
            | Self::MissingDoc { reason }
            | Self::DocValidation { reason }
            | Self::Forbidden { reason }
            | Self::QueryParse { reason } => Some(reason.clone()),
            Self::Backend(e) => Some(e.to_string()),
            Self::NotAnObject | Self::MissingId | Self::MissingBulkDocs | Self::DatabaseClosed => None,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RevConflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MissingDoc { .. })
    }

    /// Structured payload for the façade layer.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            status: self.status(),
            name: self.name().to_string(),
            message: self.to_string(),
            error: true,
            reason: self.reason(),
        }
    }
}

/// Wire shape of an error: `{status, name, message, error: true, reason?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status: u16,
    pub name: String,
    pub message: String,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<DocError> for ErrorPayload {
    fn from(err: DocError) -> Self {
        err.to_payload()
    }
}
