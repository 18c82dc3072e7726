// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query options and result rows for views and `all_docs`.
//!
//! # Example
//!
//! ```rust
//! use doc_engine::views::QueryOptions;
//! use serde_json::json;
//!
//! let opts = QueryOptions::new()
//!     .start_key(json!(["fruit"]))
//!     .end_key(json!(["fruit", {}]))
//!     .limit(10)
//!     .include_docs(true);
//! assert!(opts.inclusive_end);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options shared by view queries and `all_docs`.
///
/// `all_docs` ignores the reduce-related fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    #[serde(rename = "startkey")]
    pub start_key: Option<Value>,
    #[serde(rename = "endkey")]
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    /// Exact key; shorthand for equal start and end keys.
    pub key: Option<Value>,
    /// Fetch these keys, in this order.
    pub keys: Option<Vec<Value>>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub descending: bool,
    pub include_docs: bool,
    /// Embed `_conflicts` in included docs.
    pub conflicts: bool,
    /// `None` means "reduce if the view has a reducer".
    pub reduce: Option<bool>,
    /// Group by the exact key.
    pub group: bool,
    /// Group by the first N elements of array keys.
    pub group_level: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            inclusive_end: true,
            key: None,
            keys: None,
            skip: 0,
            limit: None,
            descending: false,
            include_docs: false,
            conflicts: false,
            reduce: None,
            group: false,
            group_level: None,
        }
    }
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn start_key(mut self, key: impl Into<Value>) -> Self {
        self.start_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn end_key(mut self, key: impl Into<Value>) -> Self {
        self.end_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn inclusive_end(mut self, inclusive: bool) -> Self {
        self.inclusive_end = inclusive;
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
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
    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    #[must_use]
    pub fn group(mut self, group: bool) -> Self {
        self.group = group;
        self
    }

    #[must_use]
    pub fn group_level(mut self, level: usize) -> Self {
        self.group_level = Some(level);
        self
    }

    /// Effective `(low, high)` bounds in traversal order.
    pub(crate) fn bounds(&self) -> (Option<&Value>, Option<&Value>) {
        match &self.key {
            Some(key) => (Some(key), Some(key)),
            None => (self.start_key.as_ref(), self.end_key.as_ref()),
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Source document; absent on reduced rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    /// Set for `keys` lookups that matched nothing in `all_docs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ViewRow {
    pub(crate) fn new(id: Option<String>, key: Value, value: Value) -> Self {
        Self {
            id,
            key,
            value,
            doc: None,
            error: None,
        }
    }
}

/// `{total_rows, offset, rows}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub total_rows: usize,
    pub offset: usize,
    pub rows: Vec<ViewRow>,
}

impl QueryResponse {
    /// Keys of the returned rows, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<&Value> {
        self.rows.iter().map(|r| &r.key).collect()
    }

    /// Document ids of the returned rows, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().filter_map(|r| r.id.as_deref()).collect()
    }
}
