// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database façade.
//!
//! [`Database`] wires the components together over one [`Backend`]:
//! - [`RevisionStore`]: per-document revision trees and the by-id index
//! - [`SequenceLog`]: ordered record of committed mutations
//! - [`ChangesFeed`]: one-shot and live change feeds
//! - [`ViewEngine`]: map/reduce indexes and `all_docs`
//!
//! # Lifecycle
//!
//! ```text
//! Created → Loading → Ready ⇄ Closed
//!                       └──→ Destroyed
//! ```
//!
//! # Example
//!
//! ```rust
//! use doc_engine::{Database, DbState, DocEngineConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let db = Database::in_memory(DocEngineConfig::default()).await.unwrap();
//! assert_eq!(db.state(), DbState::Ready);
//!
//! let created = db.put(json!({"_id": "apple", "color": "red"})).await.unwrap();
//! let doc = db.get("apple", &Default::default()).await.unwrap();
//! assert_eq!(doc["_rev"], json!(created.rev.to_string()));
//! # }
//! ```

mod api;
mod changes_api;
mod lifecycle;
mod types;
mod view_api;

pub use types::{BulkOptions, DbInfo, DbState, PutOptions, WriteResponse};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::changes::{ChangesFeed, FeedControl};
use crate::config::DocEngineConfig;
use crate::error::{DocError, Result};
use crate::seq_log::SequenceLog;
use crate::storage::{Backend, InMemoryBackend};
use crate::store::RevisionStore;
use crate::views::ViewEngine;

/// A single-node document database.
///
/// `Send + Sync`; share it behind an `Arc` for concurrent callers.
/// Writes to different documents never contend with each other.
pub struct Database {
    pub(super) config: DocEngineConfig,

    /// Stable per-instance id
    pub(super) id: String,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<DbState>,
    pub(super) state_rx: watch::Receiver<DbState>,

    pub(super) backend: Arc<dyn Backend>,
    pub(super) log: Arc<SequenceLog>,
    pub(super) store: Arc<RevisionStore>,
    pub(super) views: Arc<ViewEngine>,
    pub(super) feed: ChangesFeed,

    /// Controls of live feeds started through this database
    pub(super) live_feeds: Mutex<Vec<FeedControl>>,
}

impl Database {
    /// Create a database over `backend`.
    ///
    /// The database starts in `Created` state. Call [`start()`](Self::start)
    /// to load persisted state and transition to `Ready`.
    pub fn new(config: DocEngineConfig, backend: Arc<dyn Backend>) -> Self {
        let (state_tx, state_rx) = watch::channel(DbState::Created);
        let log = Arc::new(SequenceLog::new(Arc::clone(&backend), config.changes_batch_size));
        let store = Arc::new(RevisionStore::new(
            Arc::clone(&backend),
            Arc::clone(&log),
            config.auto_compaction,
        ));
        let views = Arc::new(ViewEngine::new(Arc::clone(&store), Arc::clone(&log), &config));
        let poll = (config.live_changes_poll_ms > 0).then(|| Duration::from_millis(config.live_changes_poll_ms));
        let feed = ChangesFeed::new(Arc::clone(&store), Arc::clone(&log), Arc::clone(&views), poll);

        Self {
            config,
            id: uuid::Uuid::new_v4().to_string(),
            state: state_tx,
            state_rx,
            backend,
            log,
            store,
            views,
            feed,
            live_feeds: Mutex::new(Vec::new()),
        }
    }

    /// Create and start a database over a fresh [`InMemoryBackend`].
    pub async fn in_memory(config: DocEngineConfig) -> Result<Self> {
        let db = Self::new(config, Arc::new(InMemoryBackend::new()));
        db.start().await?;
        Ok(db)
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DbState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<DbState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == DbState::Ready
    }

    /// Instance id, stable for the lifetime of this value.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &DocEngineConfig {
        &self.config
    }

    pub(super) fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            DbState::Ready => Ok(()),
            _ => Err(DocError::DatabaseClosed),
        }
    }

    pub(super) fn set_state(&self, state: DbState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}
