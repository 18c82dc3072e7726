// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Materialized rows of one view.
//!
//! Rows are keyed by `(collated key, doc id, emission index)`, so equal
//! keys sort by document id and then by emit order. A reverse map from
//! document to its row keys lets a document's contribution be replaced in
//! one step whenever its winner changes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included, Unbounded};

use serde_json::Value;

use super::collate::{collate, CollationKey};
use super::query::QueryOptions;
use crate::error::DocError;

/// Sort key of one row.
pub type RowKey = (CollationKey, String, usize);

/// Rows selected by a query, before skip/limit.
pub struct Selection<'a> {
    /// Rows that precede the selected range in traversal order.
    pub offset: usize,
    pub rows: Vec<(&'a RowKey, &'a Value)>,
}

/// Incrementally maintained view index.
#[derive(Default)]
pub struct ViewIndex {
    rows: BTreeMap<RowKey, Value>,
    by_doc: HashMap<String, Vec<RowKey>>,
    last_seq: u64,
    failure: Option<DocError>,
}

impl ViewIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number reflected in the rows.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn set_last_seq(&mut self, seq: u64) {
        self.last_seq = seq;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Documents with at least one emitted row.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.by_doc.len()
    }

    /// Terminal failure recorded by a refresh.
    #[must_use]
    pub fn failure(&self) -> Option<&DocError> {
        self.failure.as_ref()
    }

    pub fn fail(&mut self, err: DocError) {
        self.failure = Some(err);
    }

    /// Replace a document's rows with `emissions`.
    pub fn update_doc(&mut self, doc_id: &str, emissions: Vec<(Value, Value)>) {
        self.remove_doc(doc_id);
        if emissions.is_empty() {
            return;
        }
        let mut keys = Vec::with_capacity(emissions.len());
        for (i, (key, value)) in emissions.into_iter().enumerate() {
            let row_key = (CollationKey(key), doc_id.to_string(), i);
            self.rows.insert(row_key.clone(), value);
            keys.push(row_key);
        }
        self.by_doc.insert(doc_id.to_string(), keys);
    }

    pub fn remove_doc(&mut self, doc_id: &str) {
        if let Some(keys) = self.by_doc.remove(doc_id) {
            for key in keys {
                self.rows.remove(&key);
            }
        }
    }

    /// Drop every row and start over from seq 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Rows within the range described by `opts`, in traversal order.
    #[must_use]
    pub fn select(&self, opts: &QueryOptions) -> Selection<'_> {
        if let Some(keys) = &opts.keys {
            let rows = keys.iter().flat_map(|k| self.rows_for_key(k)).collect();
            return Selection { offset: 0, rows };
        }

        let (start, end) = opts.bounds();
        let inclusive_end = opts.inclusive_end || opts.key.is_some();
        let descending = opts.descending;
        let past_end = |key: &Value| {
            end.is_some_and(|e| {
                let ord = collate(key, e);
                let beyond = if descending { Ordering::Less } else { Ordering::Greater };
                ord == beyond || (!inclusive_end && ord == Ordering::Equal)
            })
        };

        // Seek straight to the start key; only the end is checked per row.
        let (offset, iter): (usize, Box<dyn Iterator<Item = (&RowKey, &Value)> + '_>) = if descending {
            match start.and_then(|s| self.first_after(s)) {
                Some(upper) => (
                    self.rows.range::<RowKey, _>((Included(upper), Unbounded)).count(),
                    Box::new(self.rows.range::<RowKey, _>((Unbounded, Excluded(upper))).rev()),
                ),
                None => (0, Box::new(self.rows.iter().rev())),
            }
        } else {
            match start.map(floor) {
                Some(lower) => (
                    self.rows.range::<RowKey, _>((Unbounded, Excluded(&lower))).count(),
                    Box::new(self.rows.range::<RowKey, _>((Included(&lower), Unbounded))),
                ),
                None => (0, Box::new(self.rows.iter())),
            }
        };

        let rows = iter.take_while(|(row_key, _)| !past_end(&row_key.0 .0)).collect();
        Selection { offset, rows }
    }

    /// First row whose key collates strictly after `key`.
    fn first_after(&self, key: &Value) -> Option<&RowKey> {
        self.rows
            .range(floor(key)..)
            .map(|(k, _)| k)
            .find(|k| collate(&k.0 .0, key) == Ordering::Greater)
    }

    fn rows_for_key<'a>(&'a self, key: &Value) -> impl Iterator<Item = (&'a RowKey, &'a Value)> + 'a {
        let key = key.clone();
        self.rows
            .range(floor(&key)..)
            .take_while(move |(k, _)| collate(&k.0 .0, &key) == Ordering::Equal)
    }
}

/// Smallest row key that collates with `key`.
fn floor(key: &Value) -> RowKey {
    (CollationKey(key.clone()), String::new(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index() -> ViewIndex {
        let mut index = ViewIndex::new();
        index.update_doc("d1", vec![(json!(1), json!("one"))]);
        index.update_doc("d2", vec![(json!(2), json!("two")), (json!(3), json!("three"))]);
        index.update_doc("d3", vec![(json!(2), json!("two-bis"))]);
        index
    }

    fn keys(sel: &Selection<'_>) -> Vec<Value> {
        sel.rows.iter().map(|(k, _)| k.0 .0.clone()).collect()
    }

    #[test]
    fn test_update_replaces_rows() {
        let mut index = index();
        assert_eq!(index.len(), 4);
        index.update_doc("d2", vec![(json!(9), json!(null))]);
        assert_eq!(index.len(), 3);
        index.update_doc("d2", vec![]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.doc_count(), 2);
    }

    #[test]
    fn test_equal_keys_sort_by_doc_id() {
        let index = index();
        let sel = index.select(&QueryOptions::new().key(2));
        let ids: Vec<&str> = sel.rows.iter().map(|(k, _)| k.1.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
        assert_eq!(sel.offset, 1);
    }

    #[test]
    fn test_range_and_inclusive_end() {
        let index = index();
        let sel = index.select(&QueryOptions::new().start_key(2).end_key(3));
        assert_eq!(keys(&sel), vec![json!(2), json!(2), json!(3)]);

        let sel = index.select(&QueryOptions::new().start_key(2).end_key(3).inclusive_end(false));
        assert_eq!(keys(&sel), vec![json!(2), json!(2)]);
    }

    #[test]
    fn test_descending_swaps_bounds() {
        let index = index();
        let sel = index.select(&QueryOptions::new().descending(true).start_key(2).end_key(1));
        assert_eq!(keys(&sel), vec![json!(2), json!(2), json!(1)]);
        assert_eq!(sel.offset, 1);

        let sel = index.select(&QueryOptions::new().descending(true));
        assert_eq!(keys(&sel)[0], json!(3));
    }

    #[test]
    fn test_start_key_between_rows_seeks_and_counts_offset() {
        let index = index();
        let sel = index.select(&QueryOptions::new().start_key(1.5));
        assert_eq!(keys(&sel), vec![json!(2), json!(2), json!(3)]);
        assert_eq!(sel.offset, 1);

        let sel = index.select(&QueryOptions::new().descending(true).start_key(2.5));
        assert_eq!(keys(&sel), vec![json!(2), json!(2), json!(1)]);
        assert_eq!(sel.offset, 1);

        let sel = index.select(&QueryOptions::new().start_key(10));
        assert!(sel.rows.is_empty());
        assert_eq!(sel.offset, 4);

        let sel = index.select(&QueryOptions::new().descending(true).start_key(0));
        assert!(sel.rows.is_empty());
        assert_eq!(sel.offset, 4);

        // strings collate after numbers
        let sel = index.select(&QueryOptions::new().end_key("a").inclusive_end(false));
        assert_eq!(sel.rows.len(), 4);
        assert_eq!(sel.offset, 0);
    }

    #[test]
    fn test_keys_lookup_in_requested_order() {
        let index = index();
        let sel = index.select(&QueryOptions::new().keys(vec![json!(3), json!(7), json!(1)]));
        assert_eq!(keys(&sel), vec![json!(3), json!(1)]);
    }

    #[test]
    fn test_reset() {
        let mut index = index();
        index.set_last_seq(10);
        index.fail(DocError::DatabaseClosed);
        index.reset();
        assert!(index.is_empty());
        assert_eq!(index.last_seq(), 0);
        assert!(index.failure().is_none());
    }
}
