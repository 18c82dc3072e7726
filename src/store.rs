// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The document table.
//!
//! [`RevisionStore`] owns one revision tree per document and serializes
//! writers per document with an async mutex, so unrelated documents never
//! contend. A write runs as:
//!
//! ```text
//! lock slot ─→ load tree (first touch) ─→ mutate a copy ─→ persist delta
//!     ─→ swap copy in ─→ update by-id index ─→ append seq ─→ unlock
//! ```
//!
//! The seq is appended while the slot is still locked, so entries for one
//! document appear in the log in commit order. If the append fails the slot,
//! the by-id index and the backend tree are put back as they were, so a
//! failed write leaves nothing behind and can be retried with the same rev.
//!
//! Reads never create slots for documents the backend does not have.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::document::{DocWrite, Rev, RevHistory};
use crate::error::{DocError, Result};
use crate::metrics;
use crate::rev_tree::{RevisionTree, TreeDelta, TreeError};
use crate::seq_log::SequenceLog;
use crate::storage::Backend;

/// Options for [`RevisionStore::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Fetch this revision instead of the winner.
    pub rev: Option<Rev>,
    /// Embed `_revisions: {start, ids}`.
    pub revs: bool,
    /// Embed `_revs_info: [{rev, status}]`.
    pub revs_info: bool,
    /// Embed `_conflicts` (winner only).
    pub conflicts: bool,
}

impl GetOptions {
    pub fn rev(rev: Rev) -> Self {
        Self {
            rev: Some(rev),
            ..Default::default()
        }
    }
}

/// Which revisions `get_open_revs` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRevs {
    /// Every leaf.
    All,
    Revs(Vec<Rev>),
}

/// Per-revision result of `get_open_revs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenRev {
    Ok(Value),
    Missing(Rev),
}

/// Result of a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { rev: Rev, seq: u64 },
    /// External-history write of an already known revision.
    Unchanged { rev: Rev },
}

impl WriteOutcome {
    #[must_use]
    pub fn rev(&self) -> &Rev {
        match self {
            Self::Committed { rev, .. } | Self::Unchanged { rev } => rev,
        }
    }

    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Committed { seq, .. } => Some(*seq),
            Self::Unchanged { .. } => None,
        }
    }
}

/// Winner of a document as tracked by the by-id index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocSummary {
    pub rev: Rev,
    pub deleted: bool,
}

#[derive(Default)]
struct DocSlot {
    loaded: bool,
    tree: Option<RevisionTree>,
}

/// Document table over a [`Backend`].
pub struct RevisionStore {
    backend: Arc<dyn Backend>,
    log: Arc<SequenceLog>,
    slots: DashMap<String, Arc<Mutex<DocSlot>>>,
    by_id: RwLock<BTreeMap<String, DocSummary>>,
    auto_compaction: bool,
}

impl RevisionStore {
    pub fn new(backend: Arc<dyn Backend>, log: Arc<SequenceLog>, auto_compaction: bool) -> Self {
        Self {
            backend,
            log,
            slots: DashMap::new(),
            by_id: RwLock::new(BTreeMap::new()),
            auto_compaction,
        }
    }

    fn slot(&self, doc_id: &str) -> Arc<Mutex<DocSlot>> {
        self.slots
            .entry(doc_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the slot of a document that turned out not to exist, unless
    /// another task still holds or waits on it.
    fn evict_vacant(&self, doc_id: &str) {
        self.slots.remove_if(doc_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.tree.is_none())
        });
    }

    async fn load(&self, doc_id: &str) -> Result<Option<RevisionTree>> {
        match self.backend.load(doc_id).await {
            Ok(tree) => Ok(tree),
            Err(e) => {
                metrics::record_backend_error("load");
                Err(e.into())
            }
        }
    }

    async fn ensure_loaded(&self, doc_id: &str, slot: &mut DocSlot) -> Result<()> {
        if !slot.loaded {
            slot.tree = self.load(doc_id).await?;
            slot.loaded = true;
        }
        Ok(())
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Rebuild the by-id index for the given documents from the backend.
    #[tracing::instrument(skip(self, doc_ids))]
    pub async fn restore<I>(&self, doc_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let mut restored = 0;
        for doc_id in doc_ids {
            let slot = self.slot(&doc_id);
            let mut guard = slot.lock().await;
            guard.loaded = false;
            self.ensure_loaded(&doc_id, &mut guard).await?;
            if let Some(winner) = guard.tree.as_ref().and_then(RevisionTree::winner) {
                self.by_id.write().insert(
                    doc_id.clone(),
                    DocSummary {
                        rev: winner.rev.clone(),
                        deleted: winner.deleted,
                    },
                );
                restored += 1;
            } else {
                warn!(doc_id = %doc_id, "Sequence log references a document the backend does not have");
            }
        }
        metrics::set_doc_count(self.doc_count());
        info!(documents = restored, "Document index restored");
        Ok(restored)
    }

    /// Apply one validated write.
    ///
    /// With `new_edits` the write must name a current leaf (or create the
    /// document). Without it, the supplied history is grafted verbatim.
    pub async fn write(&self, write: DocWrite, new_edits: bool) -> Result<WriteOutcome> {
        let doc_id = write.id.clone();
        let slot = self.slot(&doc_id);
        let mut guard = slot.lock().await;
        let result = self.write_locked(write, new_edits, &mut guard).await;
        let vacant = guard.tree.is_none();
        drop(guard);
        drop(slot);
        if vacant {
            self.evict_vacant(&doc_id);
        }
        result
    }

    async fn write_locked(&self, write: DocWrite, new_edits: bool, guard: &mut DocSlot) -> Result<WriteOutcome> {
        self.ensure_loaded(&write.id, guard).await?;

        let mut tree = guard.tree.clone().unwrap_or_default();
        let mark = tree.len();
        let conflict = |_: TreeError| DocError::RevConflict {
            id: write.id.clone(),
        };

        let rev = if new_edits {
            let parent = match (&write.rev, tree.winner()) {
                (Some(rev), _) => Some(rev.clone()),
                (None, None) => None,
                // recreating a deleted document extends its tombstone
                (None, Some(winner)) if winner.deleted => Some(winner.rev.clone()),
                (None, Some(_)) => return Err(conflict(TreeError::EmptyPath)),
            };
            tree.new_edit(parent.as_ref(), write.body.clone(), write.deleted)
                .map_err(conflict)?
        } else {
            let path = write.external_path()?;
            let rev = path.last().cloned().ok_or_else(|| DocError::InvalidRev {
                reason: "empty revision path".into(),
            })?;
            let inserted = tree
                .graft(&path, write.body.clone(), write.deleted)
                .map_err(|e| DocError::InvalidRev { reason: e.to_string() })?;
            if !inserted {
                debug!(doc_id = %write.id, rev = %rev, "Revision already known, skipping");
                return Ok(WriteOutcome::Unchanged { rev });
            }
            rev
        };

        let mut delta = tree.delta_since(mark);
        if self.auto_compaction {
            delta.compacted = tree.compact();
        }
        if let Err(e) = self.backend.persist(&write.id, &delta).await {
            metrics::record_backend_error("persist");
            return Err(e.into());
        }

        let (winner_rev, winner_deleted) = match tree.winner() {
            Some(w) => (w.rev.clone(), w.deleted),
            None => (rev.clone(), write.deleted),
        };
        let previous = guard.tree.replace(tree);
        // Indexed before the seq is visible so readers of the log never see
        // an entry newer than the by-id index.
        let previous_summary = self.by_id.write().insert(
            write.id.clone(),
            DocSummary {
                rev: winner_rev.clone(),
                deleted: winner_deleted,
            },
        );

        let seq = match self.log.append(&write.id, &winner_rev, winner_deleted).await {
            Ok(seq) => seq,
            Err(e) => {
                self.revert(&write.id, &delta, previous.as_ref()).await;
                guard.tree = previous;
                let mut by_id = self.by_id.write();
                match previous_summary {
                    Some(summary) => by_id.insert(write.id.clone(), summary),
                    None => by_id.remove(&write.id),
                };
                return Err(e.into());
            }
        };

        metrics::set_doc_count(self.doc_count());
        debug!(doc_id = %write.id, rev = %rev, seq, "Document committed");
        Ok(WriteOutcome::Committed { rev, seq })
    }

    /// Take back a delta the backend accepted for a write that did not commit.
    async fn revert(&self, doc_id: &str, delta: &TreeDelta, previous: Option<&RevisionTree>) {
        if let Err(e) = self.backend.persist(doc_id, &delta.undo(previous)).await {
            metrics::record_backend_error("persist");
            error!(doc_id = %doc_id, error = %e, "Failed to revert uncommitted revisions");
        }
    }

    /// Tombstone the given leaf.
    pub async fn remove(&self, doc_id: &str, rev: &Rev) -> Result<WriteOutcome> {
        match self.summary(doc_id) {
            None => return Err(DocError::missing()),
            Some(s) if s.deleted => return Err(DocError::deleted()),
            Some(_) => {}
        }
        self.write(DocWrite::tombstone(doc_id, rev.clone()), true).await
    }

    /// Apply writes in input order; each slot succeeds or fails on its own.
    pub async fn bulk(&self, writes: Vec<Result<DocWrite>>, new_edits: bool) -> Vec<Result<WriteOutcome>> {
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            results.push(match write {
                Ok(write) => self.write(write, new_edits).await,
                Err(e) => Err(e),
            });
        }
        results
    }

    /// Snapshot of a document's tree.
    pub async fn tree(&self, doc_id: &str) -> Result<Option<RevisionTree>> {
        let existing = self.slots.get(doc_id).map(|slot| slot.value().clone());
        if let Some(slot) = existing {
            let mut guard = slot.lock().await;
            self.ensure_loaded(doc_id, &mut guard).await?;
            return Ok(guard.tree.clone());
        }

        // Only existing documents get a slot. The tree is loaded again under
        // the lock since a failed write may revert it in between.
        if self.load(doc_id).await?.is_none() {
            return Ok(None);
        }
        let slot = self.slot(doc_id);
        let mut guard = slot.lock().await;
        let loaded = self.ensure_loaded(doc_id, &mut guard).await;
        let tree = guard.tree.clone();
        drop(guard);
        drop(slot);
        if tree.is_none() {
            self.evict_vacant(doc_id);
        }
        loaded.map(|()| tree)
    }

    /// Fetch a document (the winner unless `opts.rev` is set).
    pub async fn get(&self, doc_id: &str, opts: &GetOptions) -> Result<Value> {
        let tree = self.tree(doc_id).await?.ok_or_else(DocError::missing)?;
        render_rev(doc_id, &tree, opts.rev.as_ref(), opts)
    }

    /// Fetch several leaves or explicit revisions at once.
    pub async fn get_open_revs(&self, doc_id: &str, which: &OpenRevs, opts: &GetOptions) -> Result<Vec<OpenRev>> {
        let tree = self.tree(doc_id).await?.ok_or_else(DocError::missing)?;
        let revs: Vec<Rev> = match which {
            OpenRevs::All => tree.leaves().into_iter().map(|n| n.rev.clone()).collect(),
            OpenRevs::Revs(revs) => revs.clone(),
        };
        Ok(revs
            .into_iter()
            .map(|rev| match render_rev(doc_id, &tree, Some(&rev), opts) {
                Ok(doc) => OpenRev::Ok(doc),
                Err(_) => OpenRev::Missing(rev),
            })
            .collect())
    }

    /// Winner as seen by changes feeds: full doc, or a `{_id, _rev, _deleted}` stub.
    pub async fn winner_doc(&self, doc_id: &str, conflicts: bool) -> Result<Option<Value>> {
        let Some(tree) = self.tree(doc_id).await? else {
            return Ok(None);
        };
        let opts = GetOptions {
            conflicts,
            ..Default::default()
        };
        Ok(tree
            .winner()
            .map(|w| render_rev(doc_id, &tree, Some(&w.rev), &opts))
            .transpose()?)
    }

    /// Winner as seen by map functions; `None` for missing or deleted docs.
    pub async fn live_doc(&self, doc_id: &str) -> Result<Option<Value>> {
        let Some(tree) = self.tree(doc_id).await? else {
            return Ok(None);
        };
        match tree.winner() {
            Some(w) if !w.deleted => {
                let opts = GetOptions {
                    conflicts: true,
                    ..Default::default()
                };
                render_rev(doc_id, &tree, None, &opts).map(Some)
            }
            _ => Ok(None),
        }
    }

    #[must_use]
    pub fn summary(&self, doc_id: &str) -> Option<DocSummary> {
        self.by_id.read().get(doc_id).cloned()
    }

    /// Ordered copy of the by-id index.
    #[must_use]
    pub fn summaries(&self) -> BTreeMap<String, DocSummary> {
        self.by_id.read().clone()
    }

    /// Documents whose winner is not deleted.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.by_id.read().values().filter(|s| !s.deleted).count()
    }

    /// Drop non-leaf bodies across every document. Returns revisions compacted.
    #[tracing::instrument(skip(self))]
    pub async fn compact(&self) -> Result<usize> {
        let ids: Vec<String> = self.by_id.read().keys().cloned().collect();
        let mut total = 0;
        for doc_id in ids {
            let slot = self.slot(&doc_id);
            let mut guard = slot.lock().await;
            self.ensure_loaded(&doc_id, &mut guard).await?;
            let Some(mut tree) = guard.tree.clone() else {
                continue;
            };
            let compacted = tree.compact();
            if compacted.is_empty() {
                continue;
            }
            total += compacted.len();
            let delta = TreeDelta {
                compacted,
                ..Default::default()
            };
            self.backend.persist(&doc_id, &delta).await?;
            guard.tree = Some(tree);
        }
        metrics::record_compaction(total);
        info!(revisions = total, "Compaction finished");
        Ok(total)
    }

    /// Forget all cached state. Used when the database is destroyed.
    pub fn clear(&self) {
        self.slots.clear();
        self.by_id.write().clear();
    }
}

/// Render `rev` (or the winner) of a tree as a JSON document.
fn render_rev(doc_id: &str, tree: &RevisionTree, rev: Option<&Rev>, opts: &GetOptions) -> Result<Value> {
    let node = match rev {
        Some(rev) => tree.get(rev).ok_or_else(DocError::missing)?,
        None => {
            let winner = tree.winner().ok_or_else(DocError::missing)?;
            if winner.deleted {
                return Err(DocError::deleted());
            }
            winner
        }
    };
    let body = node.body.as_ref().ok_or_else(DocError::missing)?;

    let mut doc = Map::new();
    doc.insert("_id".into(), json!(doc_id));
    doc.insert("_rev".into(), json!(node.rev.to_string()));
    if node.deleted {
        doc.insert("_deleted".into(), json!(true));
    } else {
        doc.extend(body.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if opts.conflicts && tree.winner().is_some_and(|w| w.rev == node.rev) {
        let conflicts = tree.conflicts();
        if !conflicts.is_empty() {
            doc.insert(
                "_conflicts".into(),
                Value::Array(conflicts.iter().map(|r| json!(r.to_string())).collect()),
            );
        }
    }

    if opts.revs || opts.revs_info {
        let history = tree.history(&node.rev).unwrap_or_default();
        if opts.revs {
            doc.insert("_revisions".into(), json!(RevHistory::from_path(&history)));
        }
        if opts.revs_info {
            let info: Vec<Value> = history
                .iter()
                .rev()
                .map(|r| {
                    let available = tree.get(r).is_some_and(|n| n.is_available());
                    json!({
                        "rev": r.to_string(),
                        "status": if available { "available" } else { "missing" },
                    })
                })
                .collect();
            doc.insert("_revs_info".into(), Value::Array(info));
        }
    }

    Ok(Value::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;
    use serde_json::json;

    fn store() -> RevisionStore {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let log = Arc::new(SequenceLog::new(backend.clone(), 64));
        RevisionStore::new(backend, log, false)
    }

    fn doc(value: Value) -> DocWrite {
        DocWrite::from_json(value, true).unwrap()
    }

    async fn put(store: &RevisionStore, value: Value) -> Result<WriteOutcome> {
        store.write(doc(value), true).await
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = store();
        let first = put(&store, json!({"_id": "a"})).await.unwrap();
        assert_eq!(first.rev().generation, 1);
        assert_eq!(first.seq(), Some(1));

        let second = put(&store, json!({"_id": "a", "_rev": first.rev().to_string(), "v": 1}))
            .await
            .unwrap();
        assert_eq!(second.rev().generation, 2);

        let stale = put(&store, json!({"_id": "a", "_rev": first.rev().to_string(), "v": 2})).await;
        assert!(matches!(stale, Err(DocError::RevConflict { .. })));
    }

    #[tokio::test]
    async fn test_reads_of_missing_ids_do_not_cache_slots() {
        let store = store();
        put(&store, json!({"_id": "a"})).await.unwrap();
        assert_eq!(store.slot_count(), 1);

        for i in 0..50 {
            let id = format!("ghost-{i}");
            assert!(store.get(&id, &GetOptions::default()).await.is_err());
            assert!(store.get_open_revs(&id, &OpenRevs::All, &GetOptions::default()).await.is_err());
            assert!(store.live_doc(&id).await.unwrap().is_none());
            assert!(store.remove(&id, &Rev::new(1, "x")).await.is_err());
        }
        assert_eq!(store.slot_count(), 1);

        // a rejected write to a missing id leaves no slot either
        let orphan = put(&store, json!({"_id": "nobody", "_rev": "1-abc"})).await;
        assert!(matches!(orphan, Err(DocError::RevConflict { .. })));
        assert_eq!(store.slot_count(), 1);
        assert!(store.get("a", &GetOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let store = store();
        put(&store, json!({"_id": "a"})).await.unwrap();
        assert!(put(&store, json!({"_id": "a"})).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_update_missing_doc_conflicts() {
        let store = store();
        let err = put(&store, json!({"_id": "a", "_rev": "1-abc"})).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.summary("a").is_none());
    }

    #[tokio::test]
    async fn test_get_renders_body() {
        let store = store();
        let w = put(&store, json!({"_id": "a", "x": [1, 2]})).await.unwrap();
        let got = store.get("a", &GetOptions::default()).await.unwrap();
        assert_eq!(got, json!({"_id": "a", "_rev": w.rev().to_string(), "x": [1, 2]}));
    }

    #[tokio::test]
    async fn test_remove_then_get() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a", "v": 1})).await.unwrap();
        let w2 = store.remove("a", w1.rev()).await.unwrap();

        let err = store.get("a", &GetOptions::default()).await.unwrap_err();
        assert_eq!(err, DocError::deleted());

        let old = store.get("a", &GetOptions::rev(w1.rev().clone())).await.unwrap();
        assert_eq!(old["v"], json!(1));

        let stub = store.get("a", &GetOptions::rev(w2.rev().clone())).await.unwrap();
        assert_eq!(stub, json!({"_id": "a", "_rev": w2.rev().to_string(), "_deleted": true}));

        assert_eq!(store.doc_count(), 0);
        assert_eq!(store.remove("a", w2.rev()).await.unwrap_err(), DocError::deleted());
    }

    #[tokio::test]
    async fn test_remove_missing_doc() {
        let store = store();
        assert_eq!(store.remove("nope", &Rev::new(1, "x")).await.unwrap_err(), DocError::missing());
    }

    #[tokio::test]
    async fn test_recreate_after_delete_extends_tombstone() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a"})).await.unwrap();
        store.remove("a", w1.rev()).await.unwrap();
        let w3 = put(&store, json!({"_id": "a", "again": true})).await.unwrap();
        assert_eq!(w3.rev().generation, 3);
        assert_eq!(store.doc_count(), 1);
    }

    #[tokio::test]
    async fn test_revs_and_revs_info() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a"})).await.unwrap();
        let w2 = put(&store, json!({"_id": "a", "_rev": w1.rev().to_string()})).await.unwrap();

        let opts = GetOptions {
            revs: true,
            revs_info: true,
            ..Default::default()
        };
        let got = store.get("a", &opts).await.unwrap();
        assert_eq!(
            got["_revisions"],
            json!({"start": 2, "ids": [w2.rev().hash.clone(), w1.rev().hash.clone()]})
        );
        assert_eq!(got["_revs_info"][0]["status"], json!("available"));
        assert_eq!(got["_revs_info"][1]["rev"], json!(w1.rev().to_string()));

        store.compact().await.unwrap();
        let got = store.get("a", &opts).await.unwrap();
        assert_eq!(got["_revs_info"][1]["status"], json!("missing"));
        assert!(store.get("a", &GetOptions::rev(w1.rev().clone())).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_external_history_and_conflicts() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a", "v": 1})).await.unwrap();
        let w2 = put(&store, json!({"_id": "a", "_rev": w1.rev().to_string(), "v": 2}))
            .await
            .unwrap();

        let branch = DocWrite::from_json(
            json!({
                "_id": "a",
                "_rev": "2-0000",
                "_revisions": {"start": 2, "ids": ["0000", w1.rev().hash.clone()]},
                "v": "branch"
            }),
            false,
        )
        .unwrap();
        let outcome = store.write(branch.clone(), false).await.unwrap();
        assert!(outcome.seq().is_some());

        let again = store.write(branch, false).await.unwrap();
        assert_eq!(again, WriteOutcome::Unchanged { rev: Rev::new(2, "0000") });

        let opts = GetOptions {
            conflicts: true,
            ..Default::default()
        };
        let got = store.get("a", &opts).await.unwrap();
        let (winner, loser) = if w2.rev().hash.as_str() > "0000" {
            (w2.rev().to_string(), "2-0000".to_string())
        } else {
            ("2-0000".to_string(), w2.rev().to_string())
        };
        assert_eq!(got["_rev"], json!(winner));
        assert_eq!(got["_conflicts"], json!([loser]));

        let leaves = store.get_open_revs("a", &OpenRevs::All, &GetOptions::default()).await.unwrap();
        assert_eq!(leaves.len(), 2);
    }

    #[tokio::test]
    async fn test_losing_leaf_can_be_deleted() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a"})).await.unwrap();
        put(&store, json!({"_id": "a", "_rev": w1.rev().to_string(), "side": 1})).await.unwrap();
        let branch = DocWrite::from_json(
            json!({"_id": "a", "_rev": "2-0", "_revisions": {"start": 2, "ids": ["0", w1.rev().hash.clone()]}}),
            false,
        )
        .unwrap();
        store.write(branch, false).await.unwrap();

        store.remove("a", &Rev::new(2, "0")).await.unwrap();
        let tree = store.tree("a").await.unwrap().unwrap();
        assert!(tree.conflicts().is_empty());
        assert!(!tree.winner().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_external_write_requires_rev() {
        let store = store();
        let write = DocWrite::from_json(json!({"_id": "a"}), false).unwrap();
        assert!(matches!(
            store.write(write, false).await,
            Err(DocError::InvalidRev { .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_keeps_slots_independent() {
        let store = store();
        let results = store
            .bulk(
                vec![
                    Ok(doc(json!({"_id": "d1"}))),
                    Ok(doc(json!({"_id": "d1"}))),
                    Err(DocError::NotAnObject),
                    Ok(doc(json!({"_id": "d2"}))),
                ],
                true,
            )
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().rev().generation, 1);
        assert!(results[1].as_ref().unwrap_err().is_conflict());
        assert_eq!(results[2], Err(DocError::NotAnObject));
        assert_eq!(results[3].as_ref().unwrap().seq(), Some(2));
    }

    #[tokio::test]
    async fn test_open_revs_reports_missing() {
        let store = store();
        let w1 = put(&store, json!({"_id": "a"})).await.unwrap();
        let revs = OpenRevs::Revs(vec![w1.rev().clone(), Rev::new(9, "nope")]);
        let out = store.get_open_revs("a", &revs, &GetOptions::default()).await.unwrap();
        assert!(matches!(out[0], OpenRev::Ok(_)));
        assert_eq!(out[1], OpenRev::Missing(Rev::new(9, "nope")));
    }

    #[tokio::test]
    async fn test_auto_compaction() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let log = Arc::new(SequenceLog::new(backend.clone(), 64));
        let store = RevisionStore::new(backend.clone(), log, true);

        let w1 = put(&store, json!({"_id": "a"})).await.unwrap();
        put(&store, json!({"_id": "a", "_rev": w1.rev().to_string()})).await.unwrap();

        assert!(store.get("a", &GetOptions::rev(w1.rev().clone())).await.is_err());
        let persisted = backend.load("a").await.unwrap().unwrap();
        assert!(!persisted.get(w1.rev()).unwrap().is_available());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_index() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let log = Arc::new(SequenceLog::new(backend.clone(), 64));
        let original = RevisionStore::new(backend.clone(), log.clone(), false);
        put(&original, json!({"_id": "a"})).await.unwrap();
        let b = put(&original, json!({"_id": "b"})).await.unwrap();
        original.remove("b", b.rev()).await.unwrap();

        let reopened = RevisionStore::new(backend, log, false);
        let n = reopened.restore(vec!["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(reopened.doc_count(), 1);
        assert!(reopened.summary("b").unwrap().deleted);
    }
}
