// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document identity, revision ids and write parsing.
//!
//! JSON documents arrive as [`serde_json::Value`]s. [`DocWrite::from_json`]
//! strips the engine-managed members (`_id`, `_rev`, `_deleted`,
//! `_revisions`) and validates the rest before anything touches a
//! revision tree.
//!
//! # Example
//!
//! ```
//! use doc_engine::document::{DocWrite, Rev};
//! use serde_json::json;
//!
//! let write = DocWrite::from_json(json!({"_id": "a", "_rev": "1-abc", "v": 1}), true).unwrap();
//! assert_eq!(write.id, "a");
//! assert_eq!(write.rev, Some(Rev::new(1, "abc")));
//! assert_eq!(write.body.get("v"), Some(&json!(1)));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{DocError, Result};

/// Prefix of design documents (carriers of view definitions).
pub const DESIGN_PREFIX: &str = "_design/";

/// Document body: ordered mapping of string to JSON value.
pub type Body = Map<String, Value>;

/// Revision id: `(generation, hash)`, written `"{generation}-{hash}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rev {
    pub generation: u32,
    pub hash: String,
}

impl Rev {
    pub fn new(generation: u32, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }
}

impl Ord for Rev {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Rev {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Rev {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DocError::InvalidRev {
            reason: format!("invalid rev: {s:?}"),
        };
        let (generation, hash) = s.split_once('-').ok_or_else(invalid)?;
        let generation: u32 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 || hash.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(generation, hash))
    }
}

impl Serialize for Rev {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rev {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Externally supplied ancestry: `{start, ids}`, newest hash first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevHistory {
    pub start: u32,
    pub ids: Vec<String>,
}

impl RevHistory {
    /// Build the `_revisions` shape from a root-first path.
    pub fn from_path(path: &[Rev]) -> Self {
        Self {
            start: path.last().map_or(0, |r| r.generation),
            ids: path.iter().rev().map(|r| r.hash.clone()).collect(),
        }
    }

    /// Expand into revisions ordered root-most first.
    pub fn to_path(&self) -> Result<Vec<Rev>> {
        if self.ids.is_empty() || (self.ids.len() as u64) > u64::from(self.start) {
            return Err(DocError::InvalidRev {
                reason: format!(
                    "_revisions start {} cannot hold {} ids",
                    self.start,
                    self.ids.len()
                ),
            });
        }
        Ok(self
            .ids
            .iter()
            .enumerate()
            .rev()
            .map(|(i, hash)| Rev::new(self.start - i as u32, hash.clone()))
            .collect())
    }
}

/// A validated single-document write.
#[derive(Debug, Clone, PartialEq)]
pub struct DocWrite {
    pub id: String,
    /// Rev the write is based on (new edits) or the rev being imported (external history).
    pub rev: Option<Rev>,
    pub body: Body,
    pub deleted: bool,
    /// Ancestry for external-history writes.
    pub history: Option<RevHistory>,
}

impl DocWrite {
    /// Structured constructor; validates id and body members.
    pub fn new(id: impl Into<String>, rev: Option<Rev>, body: Body, deleted: bool) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        if rev.is_none() {
            if let Some(supplied) = body.get("_rev") {
                if !is_blank(supplied) {
                    return Err(DocError::InvalidId {
                        reason: Some("rev supplied in body of a new document".into()),
                    });
                }
            }
        }
        if let Some(key) = body.keys().find(|k| k.starts_with('_')) {
            return Err(DocError::DocValidation {
                reason: format!("Bad special document member: {key}"),
            });
        }
        Ok(Self {
            id,
            rev,
            body,
            deleted,
            history: None,
        })
    }

    /// Tombstone write for `remove`.
    pub fn tombstone(id: impl Into<String>, rev: Rev) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
            body: Body::new(),
            deleted: true,
            history: None,
        }
    }

    /// Parse a JSON document.
    ///
    /// `_revisions` is only honoured when `new_edits` is false.
    pub fn from_json(doc: Value, new_edits: bool) -> Result<Self> {
        let Value::Object(mut body) = doc else {
            return Err(DocError::NotAnObject);
        };
        let id = match body.remove("_id") {
            None | Some(Value::Null) => return Err(DocError::MissingId),
            Some(Value::String(id)) => id,
            Some(_) => return Err(DocError::InvalidId { reason: None }),
        };
        validate_id(&id)?;
        Self::from_parts(id, body, new_edits)
    }

    /// Parse a JSON document for `post`, generating an id when absent.
    pub fn from_json_generating_id(doc: Value) -> Result<Self> {
        let Value::Object(mut body) = doc else {
            return Err(DocError::NotAnObject);
        };
        let id = match body.remove("_id") {
            None | Some(Value::Null) => uuid::Uuid::new_v4().simple().to_string(),
            Some(Value::String(id)) => id,
            Some(_) => return Err(DocError::InvalidId { reason: None }),
        };
        validate_id(&id)?;
        Self::from_parts(id, body, true)
    }

    fn from_parts(id: String, mut body: Body, new_edits: bool) -> Result<Self> {
        let rev = match body.remove("_rev") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.parse::<Rev>()?),
            Some(other) => {
                return Err(DocError::InvalidRev {
                    reason: format!("_rev must be a string, got {other}"),
                })
            }
        };
        let deleted = match body.remove("_deleted") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => b,
            Some(other) => {
                return Err(DocError::DocValidation {
                    reason: format!("_deleted must be a boolean, got {other}"),
                })
            }
        };
        let history = match body.remove("_revisions") {
            None => None,
            Some(_) if new_edits => {
                return Err(DocError::DocValidation {
                    reason: "_revisions is only accepted when new_edits is false".into(),
                })
            }
            Some(raw) => Some(serde_json::from_value::<RevHistory>(raw).map_err(|e| {
                DocError::DocValidation {
                    reason: format!("malformed _revisions: {e}"),
                }
            })?),
        };
        if let Some(key) = body.keys().find(|k| k.starts_with('_')) {
            return Err(DocError::DocValidation {
                reason: format!("Bad special document member: {key}"),
            });
        }
        Ok(Self {
            id,
            rev,
            body,
            deleted,
            history,
        })
    }

    /// Root-first path of an external-history write, ending at `rev`.
    pub(crate) fn external_path(&self) -> Result<Vec<Rev>> {
        let rev = self.rev.clone().ok_or_else(|| DocError::InvalidRev {
            reason: "_rev is required when new_edits is false".into(),
        })?;
        let Some(history) = &self.history else {
            return Ok(vec![rev]);
        };
        let path = history.to_path()?;
        match path.last() {
            Some(last) if *last == rev => Ok(path),
            _ => Err(DocError::InvalidRev {
                reason: format!("_revisions does not end at {rev}"),
            }),
        }
    }

    #[must_use]
    pub fn is_design(&self) -> bool {
        is_design_id(&self.id)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Id rules: non-empty, and a leading underscore only for design documents.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DocError::MissingId);
    }
    if id.starts_with('_') && !is_design_id(id) {
        return Err(DocError::ReservedId { id: id.to_string() });
    }
    Ok(())
}

#[must_use]
pub fn is_design_id(id: &str) -> bool {
    id.len() > DESIGN_PREFIX.len() && id.starts_with(DESIGN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rev_roundtrip() {
        let rev: Rev = "12-deadbeef".parse().unwrap();
        assert_eq!(rev, Rev::new(12, "deadbeef"));
        assert_eq!(rev.to_string(), "12-deadbeef");
    }

    #[test]
    fn test_rev_rejects_garbage() {
        for raw in ["", "abc", "0-abc", "-abc", "3-", "x-1"] {
            assert!(
                matches!(raw.parse::<Rev>(), Err(DocError::InvalidRev { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_rev_ordering() {
        assert!(Rev::new(2, "a") > Rev::new(1, "z"));
        assert!(Rev::new(2, "b") > Rev::new(2, "a"));
    }

    #[test]
    fn test_rev_serde_as_string() {
        let value = serde_json::to_value(Rev::new(3, "ff")).unwrap();
        assert_eq!(value, json!("3-ff"));
        let back: Rev = serde_json::from_value(value).unwrap();
        assert_eq!(back, Rev::new(3, "ff"));
    }

    #[test]
    fn test_history_path() {
        let history = RevHistory {
            start: 3,
            ids: vec!["c".into(), "b".into(), "a".into()],
        };
        let path = history.to_path().unwrap();
        assert_eq!(path, vec![Rev::new(1, "a"), Rev::new(2, "b"), Rev::new(3, "c")]);
        assert_eq!(RevHistory::from_path(&path), history);
    }

    #[test]
    fn test_history_rejects_overlong_ids() {
        let history = RevHistory {
            start: 1,
            ids: vec!["b".into(), "a".into()],
        };
        assert!(history.to_path().is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(DocWrite::from_json(json!("foo"), true), Err(DocError::NotAnObject));
        assert_eq!(DocWrite::from_json(json!([]), true), Err(DocError::NotAnObject));
    }

    #[test]
    fn test_id_validation() {
        assert_eq!(DocWrite::from_json(json!({"v": 1}), true), Err(DocError::MissingId));
        assert_eq!(DocWrite::from_json(json!({"_id": ""}), true), Err(DocError::MissingId));
        assert_eq!(
            DocWrite::from_json(json!({"_id": 123}), true),
            Err(DocError::InvalidId { reason: None })
        );
        assert!(matches!(
            DocWrite::from_json(json!({"_id": "_invalid"}), true),
            Err(DocError::ReservedId { .. })
        ));
        assert!(DocWrite::from_json(json!({"_id": "_design/views"}), true).is_ok());
    }

    #[test]
    fn test_reserved_members_rejected() {
        let err = DocWrite::from_json(json!({"_id": "a", "_conflicts": []}), true).unwrap_err();
        assert!(matches!(err, DocError::DocValidation { .. }));

        let err = DocWrite::from_json(json!({"_id": "a", "_revisions": {"start": 1, "ids": ["x"]}}), true)
            .unwrap_err();
        assert!(matches!(err, DocError::DocValidation { .. }));
    }

    #[test]
    fn test_external_history_accepted_without_new_edits() {
        let write = DocWrite::from_json(
            json!({"_id": "a", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}}),
            false,
        )
        .unwrap();
        assert_eq!(
            write.external_path().unwrap(),
            vec![Rev::new(1, "a"), Rev::new(2, "b")]
        );
    }

    #[test]
    fn test_external_path_requires_rev() {
        let write = DocWrite::from_json(json!({"_id": "a"}), false).unwrap();
        assert!(matches!(write.external_path(), Err(DocError::InvalidRev { .. })));
    }

    #[test]
    fn test_structured_constructor_rejects_rev_in_body_on_create() {
        let mut body = Body::new();
        body.insert("_rev".into(), json!("1-abc"));
        assert!(matches!(
            DocWrite::new("a", None, body, false),
            Err(DocError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_post_generates_id() {
        let write = DocWrite::from_json_generating_id(json!({"v": 1})).unwrap();
        assert_eq!(write.id.len(), 32);
        assert!(!write.is_design());
    }

    #[test]
    fn test_deleted_flag_parsed() {
        let write = DocWrite::from_json(json!({"_id": "a", "_rev": "1-x", "_deleted": true}), true).unwrap();
        assert!(write.deleted);
        assert!(write.body.is_empty());
    }
}
