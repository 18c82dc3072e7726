use async_trait::async_trait;
use thiserror::Error;

use crate::rev_tree::{RevisionTree, TreeDelta};
use crate::seq_log::SeqEntry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{doc_id}': {detail}")]
    Corruption { doc_id: String, detail: String },
    #[error("Storage backend has been destroyed")]
    Destroyed,
}

/// Persistence consumed by the storage core.
///
/// Trees are written as deltas and read back whole; the sequence log is
/// append-only and read back in seq order.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Apply the nodes (and compactions) of one committed write.
    async fn persist(&self, doc_id: &str, delta: &TreeDelta) -> Result<(), StorageError>;

    async fn load(&self, doc_id: &str) -> Result<Option<RevisionTree>, StorageError>;

    async fn append_sequence(&self, entry: &SeqEntry) -> Result<(), StorageError>;

    /// Entries with `seq > since`, ascending.
    async fn read_sequences(&self, since: u64) -> Result<Vec<SeqEntry>, StorageError>;

    /// Drop everything. Default implementation is a no-op for backends
    /// whose lifetime is managed elsewhere.
    async fn destroy(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Short label for logs and metrics.
    fn name(&self) -> &'static str {
        "custom"
    }
}
