//! Retry schedule and the result types of a replay pass.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retry schedule for deferred writes: how often to retry and when to
/// give up.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Failed attempts after which a write becomes a dead letter.
  pub max_retries: u32,
  /// Delay after the first failed attempt; doubles per further failure.
  pub backoff_base: Duration,
  /// Upper bound on the delay between attempts.
  pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      backoff_base: Duration::from_secs(30),
      backoff_cap: Duration::from_secs(3600),
    }
  }
}

impl RetryPolicy {
  /// A write whose retry count reached the cap is terminal: it is kept
  /// as a dead letter but never replayed again.
  pub fn is_terminal(&self, retry_count: u32) -> bool {
    retry_count >= self.max_retries
  }

  /// Delay before the next attempt, given the number of failed attempts
  /// so far. Exponential from `backoff_base`, clamped to `backoff_cap`.
  pub fn backoff_after(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    // Clamp the exponent; the cap makes anything past 2^16 equivalent.
    let exp = attempts.saturating_sub(1).min(16);
    let delay = self.backoff_base.saturating_mul(1u32 << exp);
    delay.min(self.backoff_cap)
  }

  /// The instant before which the write must not be replayed again.
  pub fn next_gate(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(self.backoff_after(attempts))
      .unwrap_or_else(|_| chrono::Duration::hours(1));
    now + delay
  }
}

/// What one replay pass did. Writes commit in queue order; the pass stops
/// at the first write it cannot commit so that later writes never land
/// before an earlier one.
#[derive(Debug, Default)]
pub struct ReplayReport {
  /// Ids acknowledged by the backend, in queue order.
  pub committed: Vec<String>,
  /// Ids that crossed the retry cap during this pass.
  pub dead_letters: Vec<String>,
  /// The write the pass stopped on, and the error it hit.
  pub stopped_on: Option<(String, String)>,
  /// The pass stopped because this write's backoff gate is still in the
  /// future.
  pub deferred: Option<(String, DateTime<Utc>)>,
}

impl ReplayReport {
  /// True when the pass left nothing replayable behind.
  pub fn drained(&self) -> bool {
    self.stopped_on.is_none() && self.deferred.is_none()
  }
}

/// Result of asking for a replay pass.
#[derive(Debug)]
pub enum ReplayOutcome {
  /// The pass ran to its stopping condition.
  Completed(ReplayReport),
  /// Another pass already held the replay lock; nothing was done.
  AlreadyRunning,
}
