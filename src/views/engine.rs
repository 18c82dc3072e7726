// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! View registry and incremental refresh.
//!
//! Every view owns a [`ViewIndex`] behind an async mutex together with the
//! last sequence number it has consumed. A query locks the index, pulls the
//! log entries it has not seen yet, re-runs the map function for each
//! touched document and only then reads rows. Writers never wait on views.
//!
//! ```text
//! query ─→ lock index ─→ page_after(last_seq, head) ─→ live_doc(id) ─→ map
//!                                                          │
//!                           update_doc / remove_doc  ←─────┘
//! ```
//!
//! `all_docs` is served by a built-in index refreshed the same way from the
//! store's by-id summaries.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use super::collate::collate;
use super::index::ViewIndex;
use super::query::{QueryOptions, QueryResponse, ViewRow};
use super::reduce::Reducer;
use crate::config::DocEngineConfig;
use crate::document::{is_design_id, Rev, DESIGN_PREFIX};
use crate::error::{DocError, Result};
use crate::metrics;
use crate::seq_log::SequenceLog;
use crate::store::{GetOptions, RevisionStore};

/// Collects the `(key, value)` pairs a map function emits for one document.
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    pub fn emit(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.rows.push((key.into(), value.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Map function. Must be pure: the same document always emits the same rows.
pub trait MapFn: Send + Sync {
    fn map(&self, doc: &Value, emit: &mut Emitter);
}

impl<F> MapFn for F
where
    F: Fn(&Value, &mut Emitter) + Send + Sync,
{
    fn map(&self, doc: &Value, emit: &mut Emitter) {
        self(doc, emit);
    }
}

/// A map function plus an optional reducer, identified by name.
///
/// # Example
///
/// ```rust
/// use doc_engine::views::{Reducer, ViewDefinition};
///
/// let by_type = ViewDefinition::new("by_type", |doc, emit| {
///     if let Some(kind) = doc.get("type") {
///         emit.emit(kind.clone(), 1);
///     }
/// })
/// .with_reduce(Reducer::Count);
/// assert_eq!(by_type.name(), "by_type");
/// ```
#[derive(Clone)]
pub struct ViewDefinition {
    name: String,
    map: Arc<dyn MapFn>,
    reduce: Option<Reducer>,
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("name", &self.name)
            .field("reduce", &self.reduce)
            .finish_non_exhaustive()
    }
}

impl ViewDefinition {
    pub fn new<F>(name: impl Into<String>, map: F) -> Self
    where
        F: Fn(&Value, &mut Emitter) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            map: Arc::new(map),
            reduce: None,
        }
    }

    #[must_use]
    pub fn with_reduce(mut self, reducer: Reducer) -> Self {
        self.reduce = Some(reducer);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn reducer(&self) -> Option<&Reducer> {
        self.reduce.as_ref()
    }

    /// Run the map function over one document.
    #[must_use]
    pub fn map_doc(&self, doc: &Value) -> Vec<(Value, Value)> {
        let mut emitter = Emitter::default();
        self.map.map(doc, &mut emitter);
        emitter.rows
    }

    fn same_map(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.map).cast::<()>(),
            Arc::as_ptr(&other.map).cast::<()>(),
        )
    }
}

/// Where an index takes its rows from.
enum Source {
    Map(ViewDefinition),
    /// `{id: {rev}}` for every non-deleted document.
    ById,
}

struct ViewState {
    name: String,
    source: Source,
    /// Owning design document, `None` for temporary views.
    design_doc: Option<String>,
    index: Mutex<ViewIndex>,
}

impl ViewState {
    fn new(name: String, source: Source, design_doc: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            name,
            source,
            design_doc,
            index: Mutex::new(ViewIndex::new()),
        })
    }

    fn definition(&self) -> Option<&ViewDefinition> {
        match &self.source {
            Source::Map(def) => Some(def),
            Source::ById => None,
        }
    }

    /// Fresh state with the same definition and an empty index.
    fn rebuilt(&self) -> Arc<Self> {
        let source = match &self.source {
            Source::Map(def) => Source::Map(def.clone()),
            Source::ById => Source::ById,
        };
        Self::new(self.name.clone(), source, self.design_doc.clone())
    }
}

fn missing_named_view() -> DocError {
    DocError::MissingDoc {
        reason: "missing_named_view".into(),
    }
}

/// Design-document name without the `_design/` prefix.
fn ddoc_name(ddoc_id: &str) -> &str {
    ddoc_id.strip_prefix(DESIGN_PREFIX).unwrap_or(ddoc_id)
}

/// Incremental map/reduce over the document store.
pub struct ViewEngine {
    store: Arc<RevisionStore>,
    log: Arc<SequenceLog>,
    views: RwLock<HashMap<String, Arc<ViewState>>>,
    by_id: RwLock<Arc<ViewState>>,
    refresh_batch: usize,
    reduce_chunk: usize,
}

impl ViewEngine {
    pub fn new(store: Arc<RevisionStore>, log: Arc<SequenceLog>, config: &DocEngineConfig) -> Self {
        Self {
            store,
            log,
            views: RwLock::new(HashMap::new()),
            by_id: RwLock::new(ViewState::new("_all_docs".into(), Source::ById, None)),
            refresh_batch: config.view_refresh_batch_size.max(1),
            reduce_chunk: config.reduce_chunk_size.max(1),
        }
    }

    /// Names of every registered or temporary view.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.views.read().contains_key(name)
    }

    /// Definition of a view by name.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<ViewDefinition> {
        self.views.read().get(name).and_then(|s| s.definition().cloned())
    }

    /// Attach `def` to an existing design document as `ddoc/view_name`.
    ///
    /// If the design document body declares a built-in reducer for this
    /// view, the definition must agree with it (or carry no reducer, in
    /// which case the built-in is adopted).
    #[instrument(skip(self, def))]
    pub async fn register_design_view(&self, ddoc_id: &str, view_name: &str, def: ViewDefinition) -> Result<String> {
        if !is_design_id(ddoc_id) {
            return Err(DocError::InvalidId {
                reason: Some(format!("{ddoc_id} is not a design document id")),
            });
        }
        let ddoc = match self.store.get(ddoc_id, &GetOptions::default()).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => return Err(missing_named_view()),
            Err(e) => return Err(e),
        };

        let mut def = def;
        let declared = ddoc
            .pointer(&format!("/views/{view_name}/reduce"))
            .and_then(Value::as_str);
        if let Some(declared) = declared {
            let builtin = Reducer::builtin(declared)
                .ok_or_else(|| DocError::query(format!("unknown built-in reducer {declared}")))?;
            match &def.reduce {
                None => def.reduce = Some(builtin),
                Some(r) if r.name() == declared => {}
                Some(r) => {
                    return Err(DocError::query(format!(
                        "view {view_name} declares {declared} but was given {}",
                        r.name()
                    )))
                }
            }
        }

        let full_name = format!("{}/{view_name}", ddoc_name(ddoc_id));
        def.name.clone_from(&full_name);
        let state = ViewState::new(full_name.clone(), Source::Map(def), Some(ddoc_id.to_string()));
        let count = {
            let mut views = self.views.write();
            views.insert(full_name.clone(), state);
            views.len()
        };
        metrics::set_view_indexes(count);
        info!(view = %full_name, "View registered");
        Ok(full_name)
    }

    /// React to a committed write of a design document.
    ///
    /// Deleting the design document unregisters its views; any other update
    /// discards their indexes so the next query rebuilds from scratch.
    pub fn design_doc_changed(&self, ddoc_id: &str, deleted: bool) {
        let mut views = self.views.write();
        let owned: Vec<String> = views
            .iter()
            .filter(|(_, s)| s.design_doc.as_deref() == Some(ddoc_id))
            .map(|(name, _)| name.clone())
            .collect();
        if owned.is_empty() {
            return;
        }
        for name in &owned {
            if deleted {
                views.remove(name);
            } else if let Some(state) = views.get(name).map(|s| s.rebuilt()) {
                views.insert(name.clone(), state);
            }
        }
        metrics::set_view_indexes(views.len());
        debug!(ddoc = ddoc_id, views = owned.len(), deleted, "Design document changed, indexes dropped");
    }

    /// Drop indexes whose design document no longer exists, plus every
    /// temporary view. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut views = self.views.write();
        let before = views.len();
        views.retain(|_, state| match &state.design_doc {
            Some(ddoc) => self.store.summary(ddoc).is_some_and(|s| !s.deleted),
            None => false,
        });
        let removed = before - views.len();
        metrics::set_view_indexes(views.len());
        info!(removed, "View cleanup finished");
        removed
    }

    /// Forget every index. Used when the database is destroyed.
    pub fn clear(&self) {
        self.views.write().clear();
        *self.by_id.write() = ViewState::new("_all_docs".into(), Source::ById, None);
        metrics::set_view_indexes(0);
    }

    /// Query a registered view by its `ddoc/view` name.
    pub async fn query_named(&self, name: &str, opts: &QueryOptions) -> Result<QueryResponse> {
        let state = self.views.read().get(name).cloned().ok_or_else(missing_named_view)?;
        self.run(&state, opts).await
    }

    /// Query a temporary view. Its index is kept under the definition's name
    /// and refreshed incrementally on later calls; a different map function
    /// under the same name starts a fresh index.
    pub async fn query(&self, def: &ViewDefinition, opts: &QueryOptions) -> Result<QueryResponse> {
        let state = {
            let mut views = self.views.write();
            let reusable = views.get(def.name()).filter(|s| {
                s.definition()
                    .is_some_and(|d| d.same_map(def) && d.reduce.is_some() == def.reduce.is_some())
            });
            match reusable {
                Some(state) => Arc::clone(state),
                None => {
                    let state = ViewState::new(def.name.clone(), Source::Map(def.clone()), None);
                    views.insert(def.name.clone(), Arc::clone(&state));
                    metrics::set_view_indexes(views.len());
                    state
                }
            }
        };
        self.run(&state, opts).await
    }

    /// Whether `view` emits anything for `doc`.
    pub fn emits(&self, view: &str, doc: &Value) -> Result<bool> {
        let def = self.definition(view).ok_or_else(missing_named_view)?;
        Ok(!def.map_doc(doc).is_empty())
    }

    /// `{total_rows, offset, rows}` over document ids.
    pub async fn all_docs(&self, opts: &QueryOptions) -> Result<QueryResponse> {
        if opts.keys.is_some() {
            return self.all_docs_by_keys(opts).await;
        }
        let state = Arc::clone(&self.by_id.read());
        let mut opts = opts.clone();
        opts.reduce = Some(false);
        self.run(&state, &opts).await
    }

    async fn all_docs_by_keys(&self, opts: &QueryOptions) -> Result<QueryResponse> {
        let summaries = self.store.summaries();
        let total_rows = summaries.values().filter(|s| !s.deleted).count();
        let keys = opts.keys.as_deref().unwrap_or_default();
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys.iter().skip(opts.skip).take(opts.limit.unwrap_or(usize::MAX)) {
            let found = key.as_str().and_then(|id| summaries.get(id).map(|s| (id, s)));
            let row = match found {
                Some((id, summary)) => {
                    let mut value = json!({"rev": summary.rev.to_string()});
                    if summary.deleted {
                        value["deleted"] = json!(true);
                    }
                    let mut row = ViewRow::new(Some(id.to_string()), key.clone(), value);
                    if opts.include_docs {
                        row.doc = Some(if summary.deleted {
                            Value::Null
                        } else {
                            self.fetch_doc(id, None, opts.conflicts).await?
                        });
                    }
                    row
                }
                None => {
                    let mut row = ViewRow::new(None, key.clone(), Value::Null);
                    row.error = Some("not_found".into());
                    row
                }
            };
            rows.push(row);
        }
        Ok(QueryResponse {
            total_rows,
            offset: 0,
            rows,
        })
    }

    async fn run(&self, state: &ViewState, opts: &QueryOptions) -> Result<QueryResponse> {
        let _timer = metrics::LatencyTimer::new("query");
        let reducer = match (opts.reduce, state.definition().and_then(ViewDefinition::reducer)) {
            (Some(true), None) => {
                return Err(DocError::query("reduce is invalid for a view without a reduce function"))
            }
            (Some(false), _) | (None, None) => None,
            (_, Some(reducer)) => Some(reducer),
        };
        if reducer.is_some() && opts.include_docs {
            return Err(DocError::query("include_docs is invalid for reduce"));
        }

        let mut index = state.index.lock().await;
        self.refresh(state, &mut index).await?;

        let total_rows = index.len();
        let selection = index.select(opts);
        let limit = opts.limit.unwrap_or(usize::MAX);

        if let Some(reducer) = reducer {
            let rows: Vec<ViewRow> = self
                .reduce_rows(reducer, &selection.rows, opts)
                .into_iter()
                .skip(opts.skip)
                .take(limit)
                .collect();
            drop(index);
            metrics::record_view_rows(&state.name, rows.len());
            return Ok(QueryResponse {
                total_rows,
                offset: 0,
                rows,
            });
        }

        let offset = selection.offset + opts.skip;
        let mut rows: Vec<ViewRow> = selection
            .rows
            .into_iter()
            .skip(opts.skip)
            .take(limit)
            .map(|(key, value)| ViewRow::new(Some(key.1.clone()), key.0 .0.clone(), value.clone()))
            .collect();
        drop(index);

        if opts.include_docs {
            for row in &mut rows {
                row.doc = Some(self.join_doc(row, opts.conflicts).await?);
            }
        }
        metrics::record_view_rows(&state.name, rows.len());
        Ok(QueryResponse {
            total_rows,
            offset,
            rows,
        })
    }

    /// Group consecutive selected rows and reduce each group.
    fn reduce_rows(
        &self,
        reducer: &Reducer,
        selected: &[(&super::index::RowKey, &Value)],
        opts: &QueryOptions,
    ) -> Vec<ViewRow> {
        let by_requested_key = opts.keys.is_some() && opts.group_level.is_none();
        let group_key = |key: &Value| -> Value {
            match opts.group_level {
                Some(0) => Value::Null,
                Some(level) => match key {
                    Value::Array(items) => Value::Array(items.iter().take(level).cloned().collect()),
                    other => other.clone(),
                },
                None if opts.group || by_requested_key => key.clone(),
                None => Value::Null,
            }
        };

        let mut rows = Vec::new();
        let mut current: Option<Value> = None;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for (row_key, value) in selected {
            let group = group_key(&row_key.0 .0);
            let same = current
                .as_ref()
                .is_some_and(|c| collate(c, &group) == std::cmp::Ordering::Equal);
            if !same {
                if let Some(done) = current.take() {
                    let reduced = reducer.reduce_chunked(&keys, &values, self.reduce_chunk);
                    rows.push(ViewRow::new(None, done, reduced));
                    keys.clear();
                    values.clear();
                }
                current = Some(group);
            }
            keys.push(json!([row_key.0 .0, row_key.1]));
            values.push((*value).clone());
        }
        if let Some(done) = current {
            let reduced = reducer.reduce_chunked(&keys, &values, self.reduce_chunk);
            rows.push(ViewRow::new(None, done, reduced));
        }
        rows
    }

    /// Document for an `include_docs` row, following `_id` joins.
    async fn join_doc(&self, row: &ViewRow, conflicts: bool) -> Result<Value> {
        let joined = row.value.as_object().and_then(|v| v.get("_id")).and_then(Value::as_str);
        match joined {
            Some(id) => {
                let rev = row
                    .value
                    .get("_rev")
                    .and_then(Value::as_str)
                    .and_then(|r| r.parse::<Rev>().ok());
                self.fetch_doc(id, rev, conflicts).await
            }
            None => match row.id.as_deref() {
                Some(id) => self.fetch_doc(id, None, conflicts).await,
                None => Ok(Value::Null),
            },
        }
    }

    /// A document, or `null` when it is missing or deleted.
    async fn fetch_doc(&self, id: &str, rev: Option<Rev>, conflicts: bool) -> Result<Value> {
        let opts = GetOptions {
            rev,
            conflicts,
            ..Default::default()
        };
        match self.store.get(id, &opts).await {
            Ok(doc) => Ok(doc),
            Err(e) if e.is_not_found() => Ok(Value::Null),
            Err(e) => Err(e),
        }
    }

    /// Bring `index` up to the current head of the log.
    #[instrument(skip_all, fields(view = %state.name))]
    async fn refresh(&self, state: &ViewState, index: &mut ViewIndex) -> Result<()> {
        if let Some(err) = index.failure() {
            return Err(err.clone());
        }
        let started = Instant::now();
        let head = self.log.head();
        let mut touched = 0;

        while index.last_seq() < head {
            let page = self.log.page_after(index.last_seq(), head, self.refresh_batch);
            let Some(last) = page.last().map(|e| e.seq) else {
                break;
            };
            // Later entries in a page supersede earlier ones for the same doc.
            let mut seen = HashSet::new();
            for entry in page.iter().rev() {
                if !seen.insert(entry.doc_id.as_str()) {
                    continue;
                }
                if let Err(e) = self.reindex_doc(state, index, &entry.doc_id).await {
                    error!(doc_id = %entry.doc_id, error = %e, "View refresh failed");
                    index.fail(e.clone());
                    return Err(e);
                }
                touched += 1;
            }
            index.set_last_seq(last);
        }

        if touched > 0 {
            metrics::record_view_refresh(&state.name, touched, started.elapsed());
            debug!(docs = touched, last_seq = index.last_seq(), "View refreshed");
        }
        Ok(())
    }

    async fn reindex_doc(&self, state: &ViewState, index: &mut ViewIndex, doc_id: &str) -> Result<()> {
        match &state.source {
            Source::ById => match self.store.summary(doc_id) {
                Some(summary) if !summary.deleted => {
                    let value = json!({"rev": summary.rev.to_string()});
                    index.update_doc(doc_id, vec![(json!(doc_id), value)]);
                }
                _ => index.remove_doc(doc_id),
            },
            Source::Map(_) if is_design_id(doc_id) => {}
            Source::Map(def) => match self.store.live_doc(doc_id).await? {
                Some(doc) => index.update_doc(doc_id, def.map_doc(&doc)),
                None => index.remove_doc(doc_id),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocWrite;
    use crate::storage::InMemoryBackend;

    struct Fixture {
        store: Arc<RevisionStore>,
        engine: ViewEngine,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let log = Arc::new(SequenceLog::new(backend.clone(), 16));
        let store = Arc::new(RevisionStore::new(backend, Arc::clone(&log), false));
        let config = DocEngineConfig {
            view_refresh_batch_size: 2,
            reduce_chunk_size: 2,
            ..Default::default()
        };
        let engine = ViewEngine::new(Arc::clone(&store), log, &config);
        Fixture { store, engine }
    }

    async fn put(store: &RevisionStore, doc: Value) -> Rev {
        let write = DocWrite::from_json(doc, true).unwrap();
        store.write(write, true).await.unwrap().rev().clone()
    }

    fn by_type() -> ViewDefinition {
        ViewDefinition::new("by_type", |doc, emit| {
            if let Some(kind) = doc.get("type") {
                emit.emit(kind.clone(), doc.get("n").cloned().unwrap_or(Value::Null));
            }
        })
    }

    #[tokio::test]
    async fn test_incremental_refresh_tracks_updates_and_deletes() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let f = fixture();
        let mapped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&mapped);
        let view = ViewDefinition::new("by_type", move |doc, emit| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = doc.get("type") {
                emit.emit(kind.clone(), doc.get("n").cloned().unwrap_or(Value::Null));
            }
        });

        let rev = put(&f.store, json!({"_id": "a", "type": "fruit", "n": 1})).await;
        put(&f.store, json!({"_id": "b", "type": "veg", "n": 2})).await;
        let res = f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.keys(), vec![&json!("fruit"), &json!("veg")]);
        assert_eq!(mapped.load(Ordering::SeqCst), 2);

        // nothing changed, nothing mapped
        f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(mapped.load(Ordering::SeqCst), 2);

        put(&f.store, json!({"_id": "a", "_rev": rev.to_string(), "type": "zebra"})).await;
        let res = f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.ids(), vec!["b", "a"]);
        assert_eq!(res.keys(), vec![&json!("veg"), &json!("zebra")]);
        assert_eq!(mapped.load(Ordering::SeqCst), 3);

        put(&f.store, json!({"_id": "c", "type": "fruit"})).await;
        let res = f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.ids(), vec!["c", "b", "a"]);
        assert_eq!(mapped.load(Ordering::SeqCst), 4);

        let a = f.store.summary("a").unwrap();
        f.store.remove("a", &a.rev).await.unwrap();
        let res = f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.total_rows, 2);
        assert_eq!(res.ids(), vec!["c", "b"]);
        assert!(!res.keys().contains(&&json!("zebra")));
        assert_eq!(mapped.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_reduce_defaults_on_and_groups() {
        let f = fixture();
        for (id, kind, n) in [("a", "fruit", 1), ("b", "fruit", 2), ("c", "veg", 4)] {
            put(&f.store, json!({"_id": id, "type": kind, "n": n})).await;
        }
        let view = by_type().with_reduce(Reducer::Sum);

        let res = f.engine.query(&view, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.rows.len(), 1);
        assert_eq!(res.rows[0].key, Value::Null);
        assert_eq!(res.rows[0].value, json!(7));

        let res = f.engine.query(&view, &QueryOptions::new().group(true)).await.unwrap();
        let pairs: Vec<(Value, Value)> = res.rows.into_iter().map(|r| (r.key, r.value)).collect();
        assert_eq!(pairs, vec![(json!("fruit"), json!(3)), (json!("veg"), json!(4))]);

        let res = f.engine.query(&view, &QueryOptions::new().reduce(false)).await.unwrap();
        assert_eq!(res.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_group_level_truncates_array_keys() {
        let f = fixture();
        for (id, y, m) in [("a", 2024, 1), ("b", 2024, 2), ("c", 2025, 1)] {
            put(&f.store, json!({"_id": id, "date": [y, m]})).await;
        }
        let view = ViewDefinition::new("by_date", |doc, emit| {
            if let Some(date) = doc.get("date") {
                emit.emit(date.clone(), 1);
            }
        })
        .with_reduce(Reducer::Count);

        let res = f.engine.query(&view, &QueryOptions::new().group_level(1)).await.unwrap();
        let pairs: Vec<(Value, Value)> = res.rows.into_iter().map(|r| (r.key, r.value)).collect();
        assert_eq!(pairs, vec![(json!([2024]), json!(2)), (json!([2025]), json!(1))]);
    }

    #[tokio::test]
    async fn test_reduce_rejects_include_docs() {
        let f = fixture();
        let view = by_type().with_reduce(Reducer::Count);
        let err = f
            .engine
            .query(&view, &QueryOptions::new().include_docs(true))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::QueryParse { .. }));

        let err = f.engine.query(&by_type(), &QueryOptions::new().reduce(true)).await.unwrap_err();
        assert!(matches!(err, DocError::QueryParse { .. }));
    }

    #[tokio::test]
    async fn test_include_docs_follows_id_join() {
        let f = fixture();
        put(&f.store, json!({"_id": "author", "name": "Ann"})).await;
        put(&f.store, json!({"_id": "post", "author": "author"})).await;
        let view = ViewDefinition::new("posts", |doc, emit| {
            if let Some(author) = doc.get("author") {
                emit.emit(doc["_id"].clone(), json!({"_id": author}));
            }
        });
        let res = f.engine.query(&view, &QueryOptions::new().include_docs(true)).await.unwrap();
        assert_eq!(res.rows.len(), 1);
        assert_eq!(res.rows[0].id.as_deref(), Some("post"));
        assert_eq!(res.rows[0].doc.as_ref().unwrap()["name"], "Ann");
    }

    #[tokio::test]
    async fn test_offset_and_total_rows() {
        let f = fixture();
        for i in 0..5 {
            put(&f.store, json!({"_id": format!("d{i}"), "type": i})).await;
        }
        let res = f
            .engine
            .query(&by_type(), &QueryOptions::new().start_key(2).skip(1).limit(2))
            .await
            .unwrap();
        assert_eq!(res.total_rows, 5);
        assert_eq!(res.offset, 3);
        assert_eq!(res.keys(), vec![&json!(3), &json!(4)]);
    }

    #[tokio::test]
    async fn test_design_view_lifecycle() {
        let f = fixture();
        let ddoc_rev = put(&f.store, json!({"_id": "_design/app", "views": {"by_type": {"reduce": "_count"}}})).await;
        put(&f.store, json!({"_id": "a", "type": "fruit"})).await;

        let name = f.engine.register_design_view("_design/app", "by_type", by_type()).await.unwrap();
        assert_eq!(name, "app/by_type");
        assert_eq!(f.engine.definition(&name).unwrap().reducer().unwrap().name(), "_count");

        let res = f.engine.query_named(&name, &QueryOptions::new()).await.unwrap();
        assert_eq!(res.rows[0].value, json!(1));

        f.store.remove("_design/app", &ddoc_rev).await.unwrap();
        assert_eq!(f.engine.cleanup(), 1);
        let err = f.engine.query_named(&name, &QueryOptions::new()).await.unwrap_err();
        assert_eq!(err.reason().as_deref(), Some("missing_named_view"));
    }

    #[tokio::test]
    async fn test_register_requires_design_doc() {
        let f = fixture();
        let err = f
            .engine
            .register_design_view("_design/nope", "v", by_type())
            .await
            .unwrap_err();
        assert_eq!(err.reason().as_deref(), Some("missing_named_view"));
    }

    #[tokio::test]
    async fn test_design_docs_are_not_mapped() {
        let f = fixture();
        put(&f.store, json!({"_id": "_design/app", "type": "design"})).await;
        let res = f.engine.query(&by_type(), &QueryOptions::new()).await.unwrap();
        assert!(res.rows.is_empty());
    }

    #[tokio::test]
    async fn test_all_docs_range_and_keys() {
        let f = fixture();
        for id in ["b", "a", "c"] {
            put(&f.store, json!({"_id": id})).await;
        }
        let c = f.store.summary("c").unwrap();
        f.store.remove("c", &c.rev).await.unwrap();

        let res = f.engine.all_docs(&QueryOptions::new()).await.unwrap();
        assert_eq!(res.ids(), vec!["a", "b"]);
        assert_eq!(res.total_rows, 2);

        let res = f
            .engine
            .all_docs(&QueryOptions::new().keys(vec![json!("c"), json!("zz"), json!("a")]))
            .await
            .unwrap();
        assert_eq!(res.rows[0].value["deleted"], json!(true));
        assert_eq!(res.rows[1].error.as_deref(), Some("not_found"));
        assert_eq!(res.rows[2].id.as_deref(), Some("a"));
    }

    #[test]
    fn test_emits() {
        let f = fixture();
        let missing = f.engine.emits("nope", &json!({})).unwrap_err();
        assert!(missing.is_not_found());
    }
}
