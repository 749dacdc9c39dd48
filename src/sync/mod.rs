//! Deferred-write queue and replay policy.
//!
//! Writes that fail for lack of connectivity are queued durably and replayed
//! oldest-first once the network returns. Replay preserves submission order
//! as the effective commit order at the backend, retries are bounded, and a
//! write that exhausts its retries becomes a dead letter surfaced to the
//! user instead of being silently dropped.

mod queue;
mod replay;

pub use queue::{PendingWrite, SqliteQueue, WriteQueue, WriteRequest};
pub use replay::{ReplayOutcome, ReplayReport, RetryPolicy};

#[allow(unused_imports)]
pub use queue::{MemoryQueue, WriteStatus};
