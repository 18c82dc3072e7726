//! Configuration for the document engine.
//!
//! # Example
//!
//! ```
//! use doc_engine::DocEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = DocEngineConfig::default();
//! assert_eq!(config.name, "docs");
//! assert!(!config.auto_compaction);
//!
//! // Tuned config
//! let config = DocEngineConfig {
//!     name: "inventory".into(),
//!     auto_compaction: true,
//!     view_refresh_batch_size: 128,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for a [`crate::Database`].
///
/// All fields have defaults, so an empty JSON/TOML object deserializes.
#[derive(Debug, Clone, Deserialize)]
pub struct DocEngineConfig {
    /// Database name reported by `info()`
    #[serde(default = "default_name")]
    pub name: String,

    /// Compact each document right after a write (drops non-leaf bodies)
    #[serde(default)]
    pub auto_compaction: bool,

    /// Page size for lazy sequence-log iteration
    #[serde(default = "default_changes_batch_size")]
    pub changes_batch_size: usize,

    /// Upper bound on a live feed's idle wait between head checks (0 = notification only)
    #[serde(default)]
    pub live_changes_poll_ms: u64,

    /// Sequence entries consumed per view refresh step
    #[serde(default = "default_view_refresh_batch_size")]
    pub view_refresh_batch_size: usize,

    /// Leaf values reduced per chunk before rereducing the partials
    #[serde(default = "default_reduce_chunk_size")]
    pub reduce_chunk_size: usize,
}

fn default_name() -> String { "docs".to_string() }
fn default_changes_batch_size() -> usize { 256 }
fn default_view_refresh_batch_size() -> usize { 512 }
fn default_reduce_chunk_size() -> usize { 64 }

impl Default for DocEngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            auto_compaction: false,
            changes_batch_size: default_changes_batch_size(),
            live_changes_poll_ms: 0,
            view_refresh_batch_size: default_view_refresh_batch_size(),
            reduce_chunk_size: default_reduce_chunk_size(),
        }
    }
}
