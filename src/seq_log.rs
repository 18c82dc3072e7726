// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only update sequence.
//!
//! Every committed document mutation gets exactly one [`SeqEntry`]. Seqs
//! start at 1, are assigned under a short lock so the in-memory log is
//! always sorted, and are never reused. The current head is published on a
//! `watch` channel; live change feeds wait on it instead of polling.
//!
//! The in-memory copy is authoritative for readers. The backend mirror is
//! written first, under an async reservation lock, so a seq that readers can
//! see is always durable. It is only read back by [`SequenceLog::restore`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::document::Rev;
use crate::metrics;
use crate::storage::{Backend, StorageError};

/// One committed mutation: the document's winner right after the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqEntry {
    pub seq: u64,
    pub doc_id: String,
    pub rev: Rev,
    #[serde(default)]
    pub deleted: bool,
}

struct LogInner {
    entries: Vec<SeqEntry>,
    head: u64,
}

/// Ordered, append-only log of document mutations.
pub struct SequenceLog {
    inner: Mutex<LogInner>,
    append_lock: tokio::sync::Mutex<()>,
    head_tx: watch::Sender<u64>,
    backend: Arc<dyn Backend>,
    page_size: usize,
}

impl SequenceLog {
    pub fn new(backend: Arc<dyn Backend>, page_size: usize) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogInner {
                entries: Vec::new(),
                head: 0,
            }),
            append_lock: tokio::sync::Mutex::new(()),
            head_tx,
            backend,
            page_size: page_size.max(1),
        }
    }

    /// Reload entries from the backend, replacing the in-memory log.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<u64, StorageError> {
        let mut entries = self.backend.read_sequences(0).await?;
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);
        let head = entries.last().map_or(0, |e| e.seq);
        let count = entries.len();
        {
            let mut inner = self.inner.lock();
            inner.entries = entries;
            inner.head = head;
        }
        self.head_tx.send_replace(head);
        metrics::set_update_seq(head);
        info!(head, entries = count, "Sequence log restored");
        Ok(head)
    }

    /// Record a committed mutation and return its seq.
    ///
    /// The backend mirror is written before the entry becomes visible. When
    /// it fails nothing is published and the seq is not consumed.
    pub async fn append(&self, doc_id: &str, rev: &Rev, deleted: bool) -> Result<u64, StorageError> {
        let _reserve = self.append_lock.lock().await;
        let entry = SeqEntry {
            seq: self.inner.lock().head + 1,
            doc_id: doc_id.to_string(),
            rev: rev.clone(),
            deleted,
        };

        if let Err(e) = self.backend.append_sequence(&entry).await {
            metrics::record_backend_error("append_sequence");
            warn!(seq = entry.seq, doc_id = %entry.doc_id, error = %e, "Sequence append failed");
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            inner.head = entry.seq;
            inner.entries.push(entry.clone());
        }
        self.head_tx.send_if_modified(|head| {
            if entry.seq > *head {
                *head = entry.seq;
                true
            } else {
                false
            }
        });
        metrics::set_update_seq(entry.seq);
        debug!(seq = entry.seq, doc_id = %entry.doc_id, rev = %entry.rev, deleted, "Sequence appended");
        Ok(entry.seq)
    }

    /// Highest assigned seq (0 when empty).
    #[must_use]
    pub fn head(&self) -> u64 {
        self.inner.lock().head
    }

    /// Receiver that observes every head advance.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Up to `limit` entries with `after < seq <= upto`.
    #[must_use]
    pub fn page_after(&self, after: u64, upto: u64, limit: usize) -> Vec<SeqEntry> {
        let inner = self.inner.lock();
        let start = inner.entries.partition_point(|e| e.seq <= after);
        inner.entries[start..]
            .iter()
            .take_while(|e| e.seq <= upto)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Lazy iterator over entries with `seq > since`, bounded by the head
    /// at the time of the call.
    #[must_use]
    pub fn since(&self, since: u64) -> Entries<'_> {
        Entries {
            log: self,
            cursor: since,
            upper: self.head(),
            buffer: VecDeque::new(),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Forget every entry. Used when the database is destroyed.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            inner.head = 0;
        }
        self.head_tx.send_replace(0);
    }
}

/// Paged, finite view of the log; see [`SequenceLog::since`].
pub struct Entries<'a> {
    log: &'a SequenceLog,
    cursor: u64,
    upper: u64,
    buffer: VecDeque<SeqEntry>,
}

impl Iterator for Entries<'_> {
    type Item = SeqEntry;

    fn next(&mut self) -> Option<SeqEntry> {
        if self.buffer.is_empty() {
            let page = self.log.page_after(self.cursor, self.upper, self.log.page_size);
            self.cursor = page.last()?.seq;
            self.buffer.extend(page);
        }
        self.buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;

    fn log_with(page_size: usize) -> (Arc<InMemoryBackend>, SequenceLog) {
        let backend = Arc::new(InMemoryBackend::new());
        let log = SequenceLog::new(backend.clone(), page_size);
        (backend, log)
    }

    fn rev() -> Rev {
        Rev::new(1, "abc")
    }

    /// Memory backend whose sequence appends can be switched off.
    #[derive(Default)]
    struct FlakyAppends {
        inner: InMemoryBackend,
        reject: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Backend for FlakyAppends {
        async fn persist(&self, doc_id: &str, delta: &crate::rev_tree::TreeDelta) -> Result<(), StorageError> {
            self.inner.persist(doc_id, delta).await
        }

        async fn load(&self, doc_id: &str) -> Result<Option<crate::rev_tree::RevisionTree>, StorageError> {
            self.inner.load(doc_id).await
        }

        async fn append_sequence(&self, entry: &SeqEntry) -> Result<(), StorageError> {
            if self.reject.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Backend("append rejected".into()));
            }
            self.inner.append_sequence(entry).await
        }

        async fn read_sequences(&self, since: u64) -> Result<Vec<SeqEntry>, StorageError> {
            self.inner.read_sequences(since).await
        }
    }

    #[tokio::test]
    async fn test_append_assigns_from_one() {
        let (backend, log) = log_with(16);
        assert_eq!(log.head(), 0);
        assert_eq!(log.append("a", &rev(), false).await.unwrap(), 1);
        assert_eq!(log.append("b", &rev(), true).await.unwrap(), 2);
        assert_eq!(log.head(), 2);
        assert_eq!(backend.sequence_len(), 2);
    }

    #[tokio::test]
    async fn test_failed_append_publishes_nothing() {
        use std::sync::atomic::Ordering;

        let backend = Arc::new(FlakyAppends::default());
        let log = SequenceLog::new(backend.clone(), 16);
        let rx = log.subscribe();
        assert_eq!(log.append("a", &rev(), false).await.unwrap(), 1);

        backend.reject.store(true, Ordering::SeqCst);
        assert!(log.append("b", &rev(), false).await.is_err());
        assert_eq!(log.head(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(log.since(0).map(|e| e.doc_id).collect::<Vec<_>>(), vec!["a"]);

        // the failed seq is handed out again
        backend.reject.store(false, Ordering::SeqCst);
        assert_eq!(log.append("b", &rev(), false).await.unwrap(), 2);
        assert_eq!(backend.inner.sequence_len(), 2);
    }

    #[tokio::test]
    async fn test_since_is_paged_and_bounded() {
        let (_, log) = log_with(2);
        for i in 0..5 {
            log.append(&format!("d{i}"), &rev(), false).await.unwrap();
        }

        let iter = log.since(1);
        log.append("late", &rev(), false).await.unwrap();
        let seqs: Vec<u64> = iter.map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);

        assert_eq!(log.since(6).count(), 0);
        assert_eq!(log.since(0).count(), 6);
    }

    #[tokio::test]
    async fn test_page_after_respects_limit() {
        let (_, log) = log_with(16);
        for i in 0..10 {
            log.append(&format!("d{i}"), &rev(), false).await.unwrap();
        }
        let page = log.page_after(3, 10, 4);
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert!(log.page_after(3, 3, 4).is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_backend() {
        let (backend, log) = log_with(16);
        for i in 0..3 {
            log.append(&format!("d{i}"), &rev(), false).await.unwrap();
        }

        let restored = SequenceLog::new(backend, 16);
        assert_eq!(restored.restore().await.unwrap(), 3);
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.append("next", &rev(), false).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_head_watch_advances() {
        let (_, log) = log_with(16);
        let mut rx = log.subscribe();
        log.append("a", &rev(), false).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_unique() {
        let (_, log) = log_with(64);
        let log = Arc::new(log);
        let mut handles = vec![];
        for i in 0..200 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&format!("d{i}"), &Rev::new(1, "x"), false).await.unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=200).collect::<Vec<_>>());

        let logged: Vec<u64> = log.since(0).map(|e| e.seq).collect();
        assert_eq!(logged, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_clear_resets_head() {
        let (_, log) = log_with(16);
        log.append("a", &rev(), false).await.unwrap();
        log.clear();
        assert_eq!(log.head(), 0);
        assert!(log.is_empty());
    }
}
