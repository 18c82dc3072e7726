//! Public types for the database façade.

use serde::{Deserialize, Serialize};

use crate::document::Rev;
use crate::store::WriteOutcome;

/// Database lifecycle state.
///
/// Use [`super::Database::state()`] to check the current state or
/// [`super::Database::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// Just created, not yet started
    Created,
    /// Restoring the sequence log and document index
    Loading,
    /// Accepting operations
    Ready,
    /// Closed; live feeds were cancelled. `start()` reopens.
    Closed,
    /// All data dropped. Terminal.
    Destroyed,
}

impl std::fmt::Display for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// Result of [`super::Database::info()`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    /// Documents whose winner is not deleted
    pub doc_count: usize,
    /// Highest assigned sequence number
    pub update_seq: u64,
}

/// Options for [`super::Database::put_with()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// `false` imports revisions verbatim (replication-style writes).
    pub new_edits: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

/// Options for [`super::Database::bulk_docs()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOptions {
    pub new_edits: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

/// Successful write: `{ok: true, id, rev}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub id: String,
    pub rev: Rev,
}

impl WriteResponse {
    pub(crate) fn new(id: impl Into<String>, outcome: &WriteOutcome) -> Self {
        Self {
            ok: true,
            id: id.into(),
            rev: outcome.rev().clone(),
        }
    }
}
