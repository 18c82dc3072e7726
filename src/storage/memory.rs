use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{Backend, StorageError};
use crate::rev_tree::{RevisionTree, TreeDelta};
use crate::seq_log::SeqEntry;

/// Volatile backend: trees in a `DashMap`, sequences in an ordered map.
pub struct InMemoryBackend {
    trees: DashMap<String, RevisionTree>,
    sequences: RwLock<BTreeMap<u64, SeqEntry>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            trees: DashMap::new(),
            sequences: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored documents (including deleted ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    #[must_use]
    pub fn sequence_len(&self) -> usize {
        self.sequences.read().len()
    }

    pub fn clear(&self) {
        self.trees.clear();
        self.sequences.write().clear();
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn persist(&self, doc_id: &str, delta: &TreeDelta) -> Result<(), StorageError> {
        // Writers of one document are serialized upstream; apply on a copy
        // so a rejected delta leaves nothing behind.
        let mut tree = self.trees.get(doc_id).map(|t| t.value().clone()).unwrap_or_default();
        tree.apply_delta(delta).map_err(|e| StorageError::Corruption {
            doc_id: doc_id.to_string(),
            detail: e.to_string(),
        })?;
        if tree.is_empty() {
            self.trees.remove(doc_id);
        } else {
            self.trees.insert(doc_id.to_string(), tree);
        }
        Ok(())
    }

    async fn load(&self, doc_id: &str) -> Result<Option<RevisionTree>, StorageError> {
        Ok(self.trees.get(doc_id).map(|r| r.value().clone()))
    }

    async fn append_sequence(&self, entry: &SeqEntry) -> Result<(), StorageError> {
        self.sequences.write().insert(entry.seq, entry.clone());
        Ok(())
    }

    async fn read_sequences(&self, since: u64) -> Result<Vec<SeqEntry>, StorageError> {
        Ok(self
            .sequences
            .read()
            .range(since.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        self.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Body, Rev};
    use std::sync::Arc;

    fn entry(seq: u64, doc_id: &str) -> SeqEntry {
        SeqEntry {
            seq,
            doc_id: doc_id.to_string(),
            rev: Rev::new(1, "abc"),
            deleted: false,
        }
    }

    fn first_edit() -> (RevisionTree, TreeDelta) {
        let mut tree = RevisionTree::new();
        tree.new_edit(None, Body::new(), false).unwrap();
        let delta = tree.delta_since(0);
        (tree, delta)
    }

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
        assert_eq!(backend.len(), 0);
        assert_eq!(backend.sequence_len(), 0);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let backend = InMemoryBackend::new();
        let (tree, delta) = first_edit();

        backend.persist("doc-1", &delta).await.unwrap();

        let loaded = backend.load("doc-1").await.unwrap().unwrap();
        assert_eq!(loaded, tree);
        assert!(backend.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_rejects_inconsistent_delta() {
        let backend = InMemoryBackend::new();
        let mut delta = first_edit().1;
        delta.nodes[0].parent = Some(Rev::new(7, "ghost"));

        let err = backend.persist("doc-1", &delta).await.unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
        assert!(backend.load("doc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undo_of_first_edit_forgets_document() {
        let backend = InMemoryBackend::new();
        let (_, delta) = first_edit();
        backend.persist("doc-1", &delta).await.unwrap();

        backend.persist("doc-1", &delta.undo(None)).await.unwrap();
        assert!(backend.load("doc-1").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_read_sequences_since() {
        let backend = InMemoryBackend::new();
        for seq in [3, 1, 2] {
            backend.append_sequence(&entry(seq, "d")).await.unwrap();
        }

        let all = backend.read_sequences(0).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = backend.read_sequences(2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);

        assert!(backend.read_sequences(u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_clears_everything() {
        let backend = InMemoryBackend::new();
        backend.persist("doc-1", &first_edit().1).await.unwrap();
        backend.append_sequence(&entry(1, "doc-1")).await.unwrap();

        backend.destroy().await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.sequence_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_persists() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut handles = vec![];

        for i in 0..100 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let (_, delta) = first_edit();
                backend.persist(&format!("doc-{i}"), &delta).await.unwrap();
                backend.append_sequence(&entry(i + 1, "x")).await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.len(), 100);
        assert_eq!(backend.sequence_len(), 100);
    }
}
