//! # Doc Engine
//!
//! A single-node document database with revision trees, an ordered
//! changes feed and incremental map/reduce views.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Database (façade)                        │
//! │  • JSON documents in, structured writes out                │
//! │  • Lifecycle: Created → Loading → Ready → Closed           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RevisionStore                            │
//! │  • One RevisionTree per document, per-document lock        │
//! │  • Deterministic winner, conflicts, tombstones             │
//! │  • Tree deltas persisted through the Backend trait         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (one entry per committed write)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SequenceLog                              │
//! │  • Monotonic seqs, head published on a watch channel       │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                              │
//!                  ▼                              ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │ ChangesFeed                   │ │ ViewEngine                │
//! │  • One-shot snapshots         │ │  • Lazy incremental index │
//! │  • Live feeds, cancellable    │ │  • Collation, reduce      │
//! └───────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use doc_engine::{Database, DocEngineConfig};
//! use doc_engine::changes::ChangesOptions;
//! use doc_engine::views::{QueryOptions, Reducer, ViewDefinition};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Database::in_memory(DocEngineConfig::default())
//!         .await
//!         .expect("Failed to start");
//!
//!     let apple = db.put(json!({"_id": "apple", "kind": "fruit"})).await.unwrap();
//!     db.put(json!({"_id": "leek", "kind": "veg"})).await.unwrap();
//!     db.remove("apple", &apple.rev.to_string()).await.unwrap();
//!
//!     let changes = db.changes(&ChangesOptions::new()).await.unwrap();
//!     assert_eq!(changes.last_seq, 3);
//!
//!     let by_kind = ViewDefinition::new("by_kind", |doc, emit| {
//!         if let Some(kind) = doc.get("kind") {
//!             emit.emit(kind.clone(), 1);
//!         }
//!     })
//!     .with_reduce(Reducer::Count);
//!     let res = db.query(&by_kind, &QueryOptions::new()).await.unwrap();
//!     assert_eq!(res.rows[0].value, json!(1));
//! }
//! ```
//!
//! ## Modules
//!
//! - [`database`]: The [`Database`] façade and its lifecycle
//! - [`store`]: Revision trees per document, get/put/bulk/compact
//! - [`rev_tree`]: The revision tree and winner selection
//! - [`seq_log`]: The ordered update sequence
//! - [`changes`]: One-shot and live change feeds
//! - [`views`]: Map/reduce indexes and `all_docs`
//! - [`storage`]: The `Backend` trait and an in-memory implementation

pub mod changes;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod metrics;
pub mod rev_tree;
pub mod seq_log;
pub mod storage;
pub mod store;
pub mod views;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use changes::{ChangesHandle, ChangesOptions, ChangesResponse, ChangeRow, Since};
pub use config::DocEngineConfig;
pub use database::{BulkOptions, Database, DbInfo, DbState, PutOptions, WriteResponse};
pub use document::{DocWrite, Rev, RevHistory};
pub use error::{DocError, ErrorPayload, Result};
pub use metrics::LatencyTimer;
pub use rev_tree::RevisionTree;
pub use seq_log::SeqEntry;
pub use storage::{Backend, InMemoryBackend, StorageError};
pub use store::{GetOptions, OpenRev, OpenRevs};
pub use views::{QueryOptions, QueryResponse, ViewDefinition};
