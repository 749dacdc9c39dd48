//! Outcome type for requests routed through the agent.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the network.
  Network,
  /// The network failed; this is the entry cached under the same identity.
  Cache,
  /// The network failed and nothing was cached for the identity; this is
  /// the cached application root, served for navigations only.
  OfflineShell,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseSource::Network => "network",
      ResponseSource::Cache => "cache",
      ResponseSource::OfflineShell => "offline-shell",
    }
  }
}

/// Result of routing one request: the response plus its provenance.
///
/// A request that can be answered neither live nor from cache does not
/// produce an outcome at all; the fetch error propagates. The agent never
/// fabricates content.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached, for cache-served outcomes.
  pub cached_at: Option<DateTime<Utc>>,
}

impl FetchOutcome {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn offline_shell(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::OfflineShell,
      cached_at: Some(cached_at),
    }
  }

  /// Whether the response was served from cache rather than the live network.
  #[allow(dead_code)]
  pub fn is_from_cache(&self) -> bool {
    self.source != ResponseSource::Network
  }
}
