//! Per-document revision history.
//!
//! # Design
//!
//! Each document owns a forest of revisions stored as an arena: nodes live
//! in a contiguous `Vec`, parent edges are indices, and a `(generation, hash)`
//! index gives O(log n) lookup.
//!
//! ```text
//! 1-a ── 2-b ── 3-c          (winner: highest generation, non-deleted)
//!          └─── 3-d          (conflict: sibling leaf)
//! 2-x                        (disjoint root, external history only)
//! ```
//!
//! Nodes are only ever appended. Deleting a document appends a tombstone
//! leaf; compaction drops bodies of interior nodes but keeps their ids, so
//! ancestry stays intact and `revs_info` can report them as missing.
//!
//! # Hashing
//!
//! Revision hashes are derived from the parent rev, the deleted flag and
//! the body, so identical edits made on independent replicas get identical
//! ids.

mod tree;

pub use tree::{DeltaNode, InsertMode, RevNode, RevisionTree, TreeDelta};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::document::{Body, Rev};

/// Hex characters kept from the SHA-256 digest.
pub const HASH_HEX_LEN: usize = 32;

/// Errors raised by tree mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("revision {parent} is not a current leaf")]
    Conflict { parent: String },

    #[error("revision {rev} already exists")]
    Exists { rev: String },

    #[error("parent revision {parent} not found")]
    MissingParent { parent: String },

    #[error("revision {rev} must have generation {expected}")]
    Generation { rev: String, expected: u32 },

    #[error("empty revision path")]
    EmptyPath,
}

/// Deterministic hash of a new revision.
pub fn revision_hash(parent: Option<&Rev>, deleted: bool, body: &Body) -> String {
    let mut hasher = Sha256::new();
    match parent {
        Some(parent) => hasher.update(parent.to_string().as_bytes()),
        None => hasher.update(b"root"),
    }
    hasher.update(b"\0");
    hasher.update([u8::from(deleted)]);
    hasher.update(b"\0");
    // Map serialization cannot fail; keys are strings.
    hasher.update(serde_json::to_vec(body).unwrap_or_default());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_HEX_LEN);
    hex
}
