//! Versioned response cache: a tagged set of generations with one active
//! pointer.
//!
//! A generation holds at most one response per request identity; a new write
//! for the same identity overwrites the prior entry. Eviction is
//! generation-level: activation deletes every generation whose tag differs
//! from the current version, never individual entries.

mod outcome;
mod storage;

pub use outcome::{FetchOutcome, ResponseSource};
pub use storage::{GenerationInfo, GenerationStore, SqliteStore};

#[allow(unused_imports)]
pub use storage::{CachedResponse, MemoryStore};
