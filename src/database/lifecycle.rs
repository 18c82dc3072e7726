//! Database lifecycle management: start, close, destroy.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::{DocError, Result};
use crate::metrics;

use super::{Database, DbState};

impl Database {
    /// Load persisted state and start accepting operations.
    ///
    /// Startup flow:
    /// 1. Restore the sequence log from the backend
    /// 2. Rebuild the by-id index from every document the log references
    /// 3. Ready!
    ///
    /// Starting a `Ready` database is a no-op. A `Closed` database can be
    /// started again; a `Destroyed` one cannot.
    #[tracing::instrument(skip(self), fields(db = %self.config.name, backend = self.backend.name()))]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            DbState::Ready => return Ok(()),
            DbState::Destroyed | DbState::Loading => return Err(DocError::DatabaseClosed),
            DbState::Created | DbState::Closed => {}
        }
        let startup_start = Instant::now();
        info!("Starting document database...");
        self.set_state(DbState::Loading);

        let result = self.load().await;
        match result {
            Ok(()) => {
                self.set_state(DbState::Ready);
                metrics::record_startup_phase("total", startup_start.elapsed());
                info!(
                    update_seq = self.log.head(),
                    doc_count = self.store.doc_count(),
                    "Document database ready"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Startup failed");
                self.set_state(DbState::Closed);
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<()> {
        // ========== PHASE 1: Restore the sequence log ==========
        let phase_start = Instant::now();
        let head = self.log.restore().await?;
        metrics::record_startup_phase("restore_log", phase_start.elapsed());

        // ========== PHASE 2: Rebuild the by-id index ==========
        let phase_start = Instant::now();
        let doc_ids: BTreeSet<String> = self.log.since(0).map(|e| e.doc_id).collect();
        let restored = self.store.restore(doc_ids).await?;
        metrics::record_startup_phase("restore_index", phase_start.elapsed());
        metrics::set_update_seq(head);

        info!(head, documents = restored, "Persisted state loaded");
        Ok(())
    }

    /// Cancel live feeds and stop accepting operations.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if matches!(self.state(), DbState::Closed | DbState::Destroyed) {
            return;
        }
        let cancelled = self.cancel_feeds();
        self.set_state(DbState::Closed);
        info!(cancelled_feeds = cancelled, "Document database closed");
    }

    /// Drop every document, sequence entry and index. Terminal.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        if self.state() == DbState::Destroyed {
            return Ok(());
        }
        let cancelled = self.cancel_feeds();
        self.set_state(DbState::Destroyed);

        self.views.clear();
        self.store.clear();
        self.log.clear();
        if let Err(e) = self.backend.destroy().await {
            metrics::record_backend_error("destroy");
            return Err(e.into());
        }
        metrics::set_doc_count(0);
        metrics::set_update_seq(0);
        info!(cancelled_feeds = cancelled, "Document database destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocEngineConfig;
    use crate::storage::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_restart_restores_state() {
        let backend = Arc::new(InMemoryBackend::new());
        {
            let db = Database::new(DocEngineConfig::default(), backend.clone());
            db.start().await.unwrap();
            db.put(json!({"_id": "a"})).await.unwrap();
            let b = db.put(json!({"_id": "b"})).await.unwrap();
            db.remove("b", &b.rev.to_string()).await.unwrap();
            db.close().await;
        }

        let db = Database::new(DocEngineConfig::default(), backend);
        db.start().await.unwrap();
        let info = db.info().unwrap();
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.update_seq, 3);
        let next = db.put(json!({"_id": "c"})).await.unwrap();
        assert_eq!(next.rev.generation, 1);
        assert_eq!(db.info().unwrap().update_seq, 4);
    }

    #[tokio::test]
    async fn test_closed_database_rejects_operations() {
        let db = Database::in_memory(DocEngineConfig::default()).await.unwrap();
        db.close().await;
        assert_eq!(db.state(), DbState::Closed);
        let err = db.put(json!({"_id": "a"})).await.unwrap_err();
        assert_eq!(err, DocError::DatabaseClosed);
        assert_eq!(err.status(), 412);

        db.start().await.unwrap();
        assert!(db.put(json!({"_id": "a"})).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let backend = Arc::new(InMemoryBackend::new());
        let db = Database::new(DocEngineConfig::default(), backend.clone());
        db.start().await.unwrap();
        db.put(json!({"_id": "a"})).await.unwrap();

        db.destroy().await.unwrap();
        assert_eq!(db.state(), DbState::Destroyed);
        assert!(backend.is_empty());
        assert_eq!(db.start().await, Err(DocError::DatabaseClosed));
        assert!(db.info().is_err());
    }
}
