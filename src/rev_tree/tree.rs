// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Arena-backed revision forest with a cached leaf set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{revision_hash, TreeError};
use crate::document::{Body, Rev};

/// A single revision in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevNode {
    pub rev: Rev,
    /// Arena index of the parent (always lower than this node's index)
    #[serde(default)]
    pub parent: Option<usize>,
    /// `None` once compacted away, or for ancestors only known by id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default)]
    pub deleted: bool,
}

impl RevNode {
    /// Body still stored (`"available"` in revs_info).
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.body.is_some()
    }
}

/// How `insert` treats the parent reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Parent must be a current leaf; generation must follow it.
    Optimistic,
    /// Replication-style: graft anywhere, or start a disjoint root.
    ExternalHistory,
}

/// A node as carried in a [`TreeDelta`]; the parent is named by rev.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaNode {
    pub rev: Rev,
    pub parent: Option<Rev>,
    pub body: Option<Body>,
    pub deleted: bool,
}

/// What a write or compaction changed, as handed to a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeDelta {
    pub nodes: Vec<DeltaNode>,
    /// Revisions whose bodies were dropped
    #[serde(default)]
    pub compacted: Vec<Rev>,
    /// Bodies put back on existing revisions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restored: Vec<(Rev, Body)>,
    /// Revisions removed again; each must be a leaf once removal is done
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retracted: Vec<Rev>,
}

impl TreeDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.compacted.is_empty() && self.restored.is_empty() && self.retracted.is_empty()
    }

    /// Delta that takes a tree which had this delta applied back to `previous`.
    #[must_use]
    pub fn undo(&self, previous: Option<&RevisionTree>) -> TreeDelta {
        let restored = self
            .compacted
            .iter()
            .filter_map(|rev| {
                let body = previous?.get(rev)?.body.clone()?;
                Some((rev.clone(), body))
            })
            .collect();
        TreeDelta {
            restored,
            retracted: self.nodes.iter().map(|n| n.rev.clone()).collect(),
            ..Default::default()
        }
    }
}

/// All known revisions of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<RevNode>", into = "Vec<RevNode>")]
pub struct RevisionTree {
    nodes: Vec<RevNode>,
    index: BTreeMap<Rev, usize>,
    leaves: BTreeSet<usize>,
    winner: Option<usize>,
}

impl PartialEq for RevisionTree {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl TryFrom<Vec<RevNode>> for RevisionTree {
    type Error = TreeError;

    fn try_from(nodes: Vec<RevNode>) -> Result<Self, Self::Error> {
        let mut tree = Self::new();
        for (i, node) in nodes.into_iter().enumerate() {
            if let Some(parent) = node.parent {
                if parent >= i {
                    return Err(TreeError::MissingParent {
                        parent: format!("#{parent}"),
                    });
                }
            }
            if tree.index.contains_key(&node.rev) {
                return Err(TreeError::Exists {
                    rev: node.rev.to_string(),
                });
            }
            tree.push(node.rev, node.parent, node.body, node.deleted);
        }
        Ok(tree)
    }
}

impl From<RevisionTree> for Vec<RevNode> {
    fn from(tree: RevisionTree) -> Self {
        tree.nodes
    }
}

impl RevisionTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn nodes(&self) -> &[RevNode] {
        &self.nodes
    }

    #[must_use]
    pub fn get(&self, rev: &Rev) -> Option<&RevNode> {
        self.index.get(rev).map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn contains(&self, rev: &Rev) -> bool {
        self.index.contains_key(rev)
    }

    #[must_use]
    pub fn is_leaf(&self, rev: &Rev) -> bool {
        self.index.get(rev).is_some_and(|i| self.leaves.contains(i))
    }

    /// Insert one revision.
    ///
    /// Returns `Ok(false)` when an external-history write names a revision
    /// that is already known.
    pub fn insert(
        &mut self,
        rev: Rev,
        parent: Option<&Rev>,
        body: Option<Body>,
        deleted: bool,
        mode: InsertMode,
    ) -> Result<bool, TreeError> {
        if self.contains(&rev) {
            return match mode {
                InsertMode::Optimistic => Err(TreeError::Exists {
                    rev: rev.to_string(),
                }),
                InsertMode::ExternalHistory => Ok(false),
            };
        }

        let parent_idx = match parent {
            Some(p) => {
                let idx = *self.index.get(p).ok_or_else(|| match mode {
                    InsertMode::Optimistic => TreeError::Conflict {
                        parent: p.to_string(),
                    },
                    InsertMode::ExternalHistory => TreeError::MissingParent {
                        parent: p.to_string(),
                    },
                })?;
                if mode == InsertMode::Optimistic && !self.leaves.contains(&idx) {
                    return Err(TreeError::Conflict {
                        parent: p.to_string(),
                    });
                }
                if rev.generation != p.generation + 1 {
                    return Err(TreeError::Generation {
                        rev: rev.to_string(),
                        expected: p.generation + 1,
                    });
                }
                Some(idx)
            }
            None => {
                if mode == InsertMode::Optimistic {
                    if !self.is_empty() {
                        return Err(TreeError::Conflict {
                            parent: "none".into(),
                        });
                    }
                    if rev.generation != 1 {
                        return Err(TreeError::Generation {
                            rev: rev.to_string(),
                            expected: 1,
                        });
                    }
                }
                None
            }
        };

        self.push(rev, parent_idx, body, deleted);
        Ok(true)
    }

    /// Optimistic edit on top of `parent`, deriving the new rev id.
    pub fn new_edit(&mut self, parent: Option<&Rev>, body: Body, deleted: bool) -> Result<Rev, TreeError> {
        let hash = revision_hash(parent, deleted, &body);
        let rev = Rev::new(parent.map_or(1, |p| p.generation + 1), hash);
        self.insert(rev.clone(), parent, Some(body), deleted, InsertMode::Optimistic)?;
        Ok(rev)
    }

    /// Import a root-first path whose last element carries `body`.
    ///
    /// Grafts under the deepest ancestor already present; unknown ancestors
    /// are recorded without a body. With no known ancestor the path becomes
    /// a new root. Returns `false` if the leaf was already known.
    #[instrument(skip(self, body), fields(len = path.len()))]
    pub fn graft(&mut self, path: &[Rev], body: Body, deleted: bool) -> Result<bool, TreeError> {
        let (leaf, ancestors) = path.split_last().ok_or(TreeError::EmptyPath)?;
        if self.contains(leaf) {
            return Ok(false);
        }

        let known = ancestors.iter().rposition(|r| self.contains(r));
        let mut parent = known.map(|i| ancestors[i].clone());
        let from = known.map_or(0, |i| i + 1);
        for rev in &ancestors[from..] {
            self.insert(rev.clone(), parent.as_ref(), None, false, InsertMode::ExternalHistory)?;
            parent = Some(rev.clone());
        }
        self.insert(leaf.clone(), parent.as_ref(), Some(body), deleted, InsertMode::ExternalHistory)
    }

    fn push(&mut self, rev: Rev, parent: Option<usize>, body: Option<Body>, deleted: bool) {
        let idx = self.nodes.len();
        self.index.insert(rev.clone(), idx);
        self.nodes.push(RevNode {
            rev,
            parent,
            body,
            deleted,
        });
        if let Some(p) = parent {
            self.leaves.remove(&p);
        }
        self.leaves.insert(idx);
        self.recompute_winner();
    }

    fn winner_key(&self, idx: usize) -> (bool, u32, &str) {
        let node = &self.nodes[idx];
        (!node.deleted, node.rev.generation, node.rev.hash.as_str())
    }

    fn recompute_winner(&mut self) {
        self.winner = self
            .leaves
            .iter()
            .copied()
            .max_by(|&a, &b| self.winner_key(a).cmp(&self.winner_key(b)));
    }

    /// Winning revision; `None` only for an empty tree.
    #[must_use]
    pub fn winner(&self) -> Option<&RevNode> {
        self.winner.map(|i| &self.nodes[i])
    }

    /// All leaves, winner first.
    #[must_use]
    pub fn leaves(&self) -> Vec<&RevNode> {
        let mut leaves: Vec<usize> = self.leaves.iter().copied().collect();
        leaves.sort_by(|&a, &b| self.winner_key(b).cmp(&self.winner_key(a)));
        leaves.into_iter().map(|i| &self.nodes[i]).collect()
    }

    /// Non-deleted leaves other than the winner.
    #[must_use]
    pub fn conflicts(&self) -> Vec<&Rev> {
        self.leaves()
            .into_iter()
            .skip(1)
            .filter(|n| !n.deleted)
            .map(|n| &n.rev)
            .collect()
    }

    /// Ancestor ids from root to `rev` inclusive.
    #[must_use]
    pub fn history(&self, rev: &Rev) -> Option<Vec<Rev>> {
        let mut cursor = self.index.get(rev).copied();
        let mut path = Vec::new();
        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            path.push(node.rev.clone());
            cursor = node.parent;
        }
        if path.is_empty() {
            return None;
        }
        path.reverse();
        Some(path)
    }

    /// Drop bodies of every non-leaf revision.
    pub fn compact(&mut self) -> Vec<Rev> {
        let mut dropped = Vec::new();
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if !self.leaves.contains(&idx) && node.body.take().is_some() {
                dropped.push(node.rev.clone());
            }
        }
        dropped
    }

    /// Nodes appended since the tree had `mark` nodes.
    #[must_use]
    pub fn delta_since(&self, mark: usize) -> TreeDelta {
        let nodes = self.nodes[mark.min(self.nodes.len())..]
            .iter()
            .map(|n| DeltaNode {
                rev: n.rev.clone(),
                parent: n.parent.map(|p| self.nodes[p].rev.clone()),
                body: n.body.clone(),
                deleted: n.deleted,
            })
            .collect();
        TreeDelta {
            nodes,
            ..Default::default()
        }
    }

    /// Replay a delta produced by another copy of this tree.
    pub fn apply_delta(&mut self, delta: &TreeDelta) -> Result<(), TreeError> {
        for node in &delta.nodes {
            self.insert(
                node.rev.clone(),
                node.parent.as_ref(),
                node.body.clone(),
                node.deleted,
                InsertMode::ExternalHistory,
            )?;
        }
        for rev in &delta.compacted {
            if let Some(&idx) = self.index.get(rev) {
                self.nodes[idx].body = None;
            }
        }
        for (rev, body) in &delta.restored {
            if let Some(&idx) = self.index.get(rev) {
                self.nodes[idx].body = Some(body.clone());
            }
        }
        if !delta.retracted.is_empty() {
            self.retract(&delta.retracted)?;
        }
        Ok(())
    }

    /// Remove revisions that nothing else descends from. Unknown revs are
    /// ignored.
    pub fn retract(&mut self, revs: &[Rev]) -> Result<(), TreeError> {
        let doomed: BTreeSet<usize> = revs.iter().filter_map(|r| self.index.get(r).copied()).collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let mut remap = vec![None; self.nodes.len()];
        let mut kept = Vec::with_capacity(self.nodes.len() - doomed.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if doomed.contains(&idx) {
                continue;
            }
            let parent = match node.parent {
                Some(p) if doomed.contains(&p) => {
                    return Err(TreeError::Conflict {
                        parent: self.nodes[p].rev.to_string(),
                    })
                }
                Some(p) => remap[p],
                None => None,
            };
            remap[idx] = Some(kept.len());
            kept.push(RevNode {
                parent,
                ..node.clone()
            });
        }
        *self = Self::try_from(kept)?;
        Ok(())
    }
}
