// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document API: put, post, remove, bulk, get, compaction and `info`.

use serde_json::Value;
use tracing::debug;

use crate::document::{DocWrite, Rev};
use crate::error::{DocError, Result};
use crate::metrics::{self, LatencyTimer};
use crate::store::{GetOptions, OpenRev, OpenRevs, WriteOutcome};
use crate::views::{QueryOptions, QueryResponse};

use super::{BulkOptions, Database, DbInfo, PutOptions, WriteResponse};

impl Database {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create or update a document.
    ///
    /// Without `_rev` the document must not exist (or its winner must be
    /// deleted). With `_rev` the rev must be a current leaf, otherwise the
    /// write fails with [`DocError::RevConflict`].
    ///
    /// # Example
    ///
    /// ```rust
    /// # use doc_engine::{Database, DocEngineConfig};
    /// # use serde_json::json;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let db = Database::in_memory(DocEngineConfig::default()).await.unwrap();
    /// let first = db.put(json!({"_id": "a"})).await.unwrap();
    /// let second = db
    ///     .put(json!({"_id": "a", "_rev": first.rev.to_string(), "v": 1}))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(second.rev.generation, 2);
    ///
    /// let stale = db.put(json!({"_id": "a", "_rev": first.rev.to_string()})).await;
    /// assert!(stale.unwrap_err().is_conflict());
    /// # }
    /// ```
    pub async fn put(&self, doc: Value) -> Result<WriteResponse> {
        self.put_with(doc, PutOptions::default()).await
    }

    /// [`put`](Self::put) with options. `new_edits: false` imports the
    /// supplied `_rev` (and `_revisions` ancestry) verbatim.
    pub async fn put_with(&self, doc: Value, opts: PutOptions) -> Result<WriteResponse> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("put");
        let result = match DocWrite::from_json(doc, opts.new_edits) {
            Ok(write) => self.commit(write, opts.new_edits).await,
            Err(e) => Err(e),
        };
        metrics::record_result("put", &result);
        result
    }

    /// Create a document, generating its id when `_id` is absent.
    pub async fn post(&self, doc: Value) -> Result<WriteResponse> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("post");
        let result = match DocWrite::from_json_generating_id(doc) {
            Ok(write) => self.commit(write, true).await,
            Err(e) => Err(e),
        };
        metrics::record_result("post", &result);
        result
    }

    /// Apply an already validated write.
    pub async fn write_doc(&self, write: DocWrite, new_edits: bool) -> Result<WriteResponse> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("put");
        let result = self.commit(write, new_edits).await;
        metrics::record_result("put", &result);
        result
    }

    /// Tombstone the leaf `rev` of `id`.
    pub async fn remove(&self, id: &str, rev: &str) -> Result<WriteResponse> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("remove");
        let result = self.remove_inner(id, rev).await;
        metrics::record_result("remove", &result);
        result
    }

    async fn remove_inner(&self, id: &str, rev: &str) -> Result<WriteResponse> {
        match self.store.summary(id) {
            None => return Err(DocError::missing()),
            Some(s) if s.deleted => return Err(DocError::deleted()),
            Some(_) => {}
        }
        let rev: Rev = rev.parse()?;
        let outcome = self.store.remove(id, &rev).await?;
        self.after_commit(id, &outcome);
        Ok(WriteResponse::new(id, &outcome))
    }

    /// Write many documents. Each slot succeeds or fails on its own; output
    /// order matches input order.
    pub async fn bulk_docs(&self, docs: Vec<Value>, opts: BulkOptions) -> Result<Vec<Result<WriteResponse>>> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("bulk");
        metrics::record_bulk_size(docs.len());

        let writes: Vec<Result<DocWrite>> = docs
            .into_iter()
            .map(|doc| DocWrite::from_json(doc, opts.new_edits))
            .collect();
        let ids: Vec<Option<String>> = writes
            .iter()
            .map(|w| w.as_ref().ok().map(|w| w.id.clone()))
            .collect();

        let outcomes = self.store.bulk(writes, opts.new_edits).await;
        let results: Vec<Result<WriteResponse>> = outcomes
            .into_iter()
            .zip(ids)
            .map(|(outcome, id)| {
                let outcome = outcome?;
                let id = id.unwrap_or_default();
                self.after_commit(&id, &outcome);
                Ok(WriteResponse::new(id, &outcome))
            })
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        for result in &results {
            metrics::record_result("bulk", result);
        }
        debug!(total = results.len(), failed, "Bulk write completed");
        Ok(results)
    }

    /// Parse a `{docs: [...], new_edits?}` request body and run
    /// [`bulk_docs`](Self::bulk_docs).
    pub async fn bulk_docs_request(&self, request: Value) -> Result<Vec<Result<WriteResponse>>> {
        self.ensure_ready()?;
        let Value::Object(mut request) = request else {
            return Err(DocError::MissingBulkDocs);
        };
        let docs = match request.remove("docs") {
            Some(Value::Array(docs)) => docs,
            _ => return Err(DocError::MissingBulkDocs),
        };
        let new_edits = match request.get("new_edits") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(DocError::DocValidation {
                    reason: format!("new_edits must be a boolean, got {other}"),
                })
            }
        };
        self.bulk_docs(docs, BulkOptions { new_edits }).await
    }

    async fn commit(&self, write: DocWrite, new_edits: bool) -> Result<WriteResponse> {
        let id = write.id.clone();
        let outcome = self.store.write(write, new_edits).await?;
        self.after_commit(&id, &outcome);
        Ok(WriteResponse::new(id, &outcome))
    }

    /// Drop stale indexes when a design document changes.
    fn after_commit(&self, id: &str, outcome: &WriteOutcome) {
        if outcome.seq().is_none() || !crate::document::is_design_id(id) {
            return;
        }
        let gone = self.store.summary(id).map_or(true, |s| s.deleted);
        self.views.design_doc_changed(id, gone);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fetch a document: the winner, or `opts.rev` when set.
    pub async fn get(&self, id: &str, opts: &GetOptions) -> Result<Value> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("get");
        let result = self.store.get(id, opts).await;
        metrics::record_result("get", &result);
        result
    }

    /// Fetch every leaf, or the listed revisions, of a document.
    pub async fn get_open_revs(&self, id: &str, which: &OpenRevs, opts: &GetOptions) -> Result<Vec<OpenRev>> {
        self.ensure_ready()?;
        let result = self.store.get_open_revs(id, which, opts).await;
        metrics::record_result("get", &result);
        result
    }

    /// `{total_rows, offset, rows}` over document ids.
    pub async fn all_docs(&self, opts: &QueryOptions) -> Result<QueryResponse> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("all_docs");
        let result = self.views.all_docs(opts).await;
        metrics::record_result("all_docs", &result);
        result
    }

    /// `{db_name, doc_count, update_seq}`.
    pub fn info(&self) -> Result<DbInfo> {
        self.ensure_ready()?;
        Ok(DbInfo {
            db_name: self.config.name.clone(),
            doc_count: self.store.doc_count(),
            update_seq: self.log.head(),
        })
    }

    /// Drop the bodies of every non-leaf revision. Returns how many were dropped.
    pub async fn compact(&self) -> Result<usize> {
        self.ensure_ready()?;
        self.store.compact().await
    }
}
