//! Pluggable persistence for revision trees and the sequence log.
//!
//! The engine only talks to [`Backend`]; [`InMemoryBackend`] is the
//! default implementation.

pub mod memory;
pub mod traits;

pub use memory::InMemoryBackend;
pub use traits::{Backend, StorageError};
