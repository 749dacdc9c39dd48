//! Push-notification payloads and the delivery seam.

use serde::Deserialize;

/// Title used when a payload carries none.
pub const DEFAULT_TITLE: &str = "cachesync";
/// Body used when a payload carries none.
pub const DEFAULT_BODY: &str = "You have a new notification";

/// An incoming push payload. Both fields are optional; a malformed payload
/// behaves like an empty one.
#[derive(Debug, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
}

impl PushPayload {
  /// Parse raw payload bytes. Anything that is not a JSON object with the
  /// expected shape falls back to the empty payload, which renders
  /// entirely from the defaults.
  pub fn parse(raw: &[u8]) -> Self {
    serde_json::from_slice(raw).unwrap_or_default()
  }

  pub fn into_notification(self) -> Notification {
    Notification {
      title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: self.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
    }
  }
}

/// A rendered notification, ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
}

impl Notification {
  /// Emitted when a deferred write exhausts its retries and is set aside.
  pub fn write_abandoned(id: &str, error: &str) -> Self {
    Self {
      title: "Upload failed".to_string(),
      body: format!("Queued upload {} was set aside after repeated failures: {}", id, error),
    }
  }
}

/// Delivery seam. Production renders into the structured log; tests record.
pub trait NotificationSink: Send + Sync {
  fn deliver(&self, notification: &Notification);
}

/// Sink that renders notifications as log lines.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
  fn deliver(&self, notification: &Notification) {
    tracing::info!(title = %notification.title, body = %notification.body, "notification");
  }
}
