// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Changes feed over the sequence log.
//!
//! Two modes share one row builder:
//!
//! - **One-shot** ([`ChangesFeed::changes`]): snapshot the log up to the
//!   current head, keep each document's latest entry, filter, return.
//! - **Live** ([`ChangesFeed::live`]): a spawned task delivers the same
//!   snapshot and then every new entry as the head advances, until it is
//!   cancelled, reaches `limit`, or sits idle past `timeout`.
//!   [`ChangesFeed::live_stream`] is the same feed read from a channel.
//!
//! ```text
//! SequenceLog ──page_after──► doc_ids ─► winner_doc ─► filter ─► view ─► row
//!      │                                                                  │
//!      └── head watch ──► live task wakes                 on_change ◄─────┘
//! ```

mod live;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::document::Rev;
use crate::error::{DocError, Result};
use crate::metrics;
use crate::seq_log::{SeqEntry, SequenceLog};
use crate::store::RevisionStore;
use crate::views::ViewEngine;

pub use live::{
    ChangesCallbacks, ChangesHandle, ChangesListener, ChangesStream, ChangesSummary, CompletionStatus, FeedControl,
    FeedState,
};

/// Where a feed starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
    /// Entries with a greater seq.
    Seq(u64),
    /// The head at subscription time.
    Now,
}

impl Default for Since {
    fn default() -> Self {
        Self::Seq(0)
    }
}

impl From<u64> for Since {
    fn from(seq: u64) -> Self {
        Self::Seq(seq)
    }
}

impl Since {
    fn resolve(self, head: u64) -> u64 {
        match self {
            Self::Seq(seq) => seq,
            Self::Now => head,
        }
    }
}

/// Caller predicate over the (full or tombstone-stub) winner document.
pub type ChangesFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Options for one-shot and live feeds.
#[derive(Clone, Default)]
pub struct ChangesOptions {
    pub since: Since,
    pub include_docs: bool,
    /// Embed `_conflicts` in included docs.
    pub conflicts: bool,
    /// Newest first. One-shot only.
    pub descending: bool,
    pub doc_ids: Option<Vec<String>>,
    pub filter: Option<ChangesFilter>,
    /// Keep documents for which this registered view emits.
    pub view: Option<String>,
    pub limit: Option<usize>,
    /// Live only: finish with `timeout` after this long without new entries.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for ChangesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesOptions")
            .field("since", &self.since)
            .field("include_docs", &self.include_docs)
            .field("conflicts", &self.conflicts)
            .field("descending", &self.descending)
            .field("doc_ids", &self.doc_ids)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("view", &self.view)
            .field("limit", &self.limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ChangesOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn since(mut self, since: impl Into<Since>) -> Self {
        self.since = since.into();
        self
    }

    #[must_use]
    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    #[must_use]
    pub fn conflicts(mut self, conflicts: bool) -> Self {
        self.conflicts = conflicts;
        self
    }

    #[must_use]
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    #[must_use]
    pub fn doc_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn needs_doc(&self) -> bool {
        self.include_docs || self.filter.is_some() || self.view.is_some()
    }
}

/// `{rev}` element of a row's `changes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: Rev,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One delivered change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl ChangeRow {
    /// Winner revision at this seq.
    #[must_use]
    pub fn rev(&self) -> Option<&Rev> {
        self.changes.first().map(|c| &c.rev)
    }
}

/// Result of a one-shot feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: u64,
}

/// Builds change rows from the sequence log.
#[derive(Clone)]
pub struct ChangesFeed {
    store: Arc<RevisionStore>,
    log: Arc<SequenceLog>,
    views: Arc<ViewEngine>,
    /// Upper bound on an idle live wait; `None` waits on notifications only.
    poll: Option<Duration>,
}

impl ChangesFeed {
    pub fn new(
        store: Arc<RevisionStore>,
        log: Arc<SequenceLog>,
        views: Arc<ViewEngine>,
        poll: Option<Duration>,
    ) -> Self {
        Self { store, log, views, poll }
    }

    /// One-shot snapshot of everything after `opts.since`.
    #[tracing::instrument(skip(self, opts), fields(since = ?opts.since))]
    pub async fn changes(&self, opts: &ChangesOptions) -> Result<ChangesResponse> {
        self.check_view(opts)?;
        let head = self.log.head();
        let since = opts.since.resolve(head);

        let mut entries = self.snapshot(since, head);
        if opts.descending {
            entries.reverse();
        }

        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        for entry in &entries {
            if results.len() >= limit {
                break;
            }
            if let Some(row) = self.build_row(entry, opts).await? {
                results.push(row);
            }
        }

        let last_seq = results.last().map_or(head, |r| r.seq);
        metrics::record_changes_delivered("oneshot", results.len());
        debug!(rows = results.len(), last_seq, "Changes snapshot served");
        Ok(ChangesResponse { results, last_seq })
    }

    /// Latest entry per document with `after < seq <= upto`, ascending.
    fn snapshot(&self, after: u64, upto: u64) -> Vec<SeqEntry> {
        let mut latest: HashMap<String, SeqEntry> = HashMap::new();
        let mut cursor = after;
        loop {
            let page = self.log.page_after(cursor, upto, self.log.page_size());
            let Some(last) = page.last().map(|e| e.seq) else {
                break;
            };
            cursor = last;
            for entry in page {
                latest.insert(entry.doc_id.clone(), entry);
            }
        }
        let mut entries: Vec<SeqEntry> = latest.into_values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    fn check_view(&self, opts: &ChangesOptions) -> Result<()> {
        match &opts.view {
            Some(view) if !self.views.contains(view) => Err(DocError::MissingDoc {
                reason: "missing_named_view".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Apply the filters to one entry; `None` means filtered out.
    async fn build_row(&self, entry: &SeqEntry, opts: &ChangesOptions) -> Result<Option<ChangeRow>> {
        if let Some(ids) = &opts.doc_ids {
            if !ids.iter().any(|id| id == &entry.doc_id) {
                return Ok(None);
            }
        }

        let doc = if opts.needs_doc() {
            match self.store.winner_doc(&entry.doc_id, opts.conflicts).await? {
                Some(doc) => Some(doc),
                None => return Ok(None),
            }
        } else {
            None
        };

        if let (Some(filter), Some(doc)) = (&opts.filter, &doc) {
            if !filter(doc) {
                return Ok(None);
            }
        }
        if let (Some(view), Some(doc)) = (&opts.view, &doc) {
            if !self.views.emits(view, doc)? {
                return Ok(None);
            }
        }

        Ok(Some(ChangeRow {
            seq: entry.seq,
            id: entry.doc_id.clone(),
            changes: vec![ChangeRev { rev: entry.rev.clone() }],
            deleted: entry.deleted,
            doc: if opts.include_docs { doc } else { None },
        }))
    }
}
