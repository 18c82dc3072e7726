// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Map/reduce secondary indexes.
//!
//! - [`collate`]: total order over emitted keys
//! - [`reduce`]: built-in and custom reducers
//! - [`query`]: query options and result rows
//! - [`index`]: the materialized rows of one view
//! - [`ViewEngine`]: registry plus incremental refresh from the sequence log

pub mod collate;
mod engine;
pub mod index;
pub mod query;
pub mod reduce;

pub use collate::{collate, CollationKey};
pub use engine::{Emitter, MapFn, ViewDefinition, ViewEngine};
pub use index::ViewIndex;
pub use query::{QueryOptions, QueryResponse, ViewRow};
pub use reduce::{ReduceFn, Reducer};
