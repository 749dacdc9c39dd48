use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Runtime loop events
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
  /// Connectivity to the origin came back.
  Online,
  /// Connectivity to the origin dropped.
  Offline,
  /// A sync tag was registered; queued writes want a replay pass.
  SyncRequested(String),
  /// Periodic heartbeat; lets the loop retry writes whose backoff expired.
  Tick,
}

/// Event handler that merges connectivity probes with sync registrations
/// from the agent.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Spawn the producers. `probe` is called once per interval; Online and
  /// Offline are edge-triggered, every uneventful probe becomes a Tick.
  pub fn new<P, Fut>(
    probe_interval: Duration,
    probe: P,
    sync_rx: mpsc::UnboundedReceiver<String>,
  ) -> Self
  where
    P: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Connectivity watcher
    {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(probe_interval);
        let mut online: Option<bool> = None;
        loop {
          interval.tick().await;
          let now_online = probe().await;
          if online != Some(now_online) {
            online = Some(now_online);
            let event = if now_online { Event::Online } else { Event::Offline };
            if tx.send(event).is_err() {
              break;
            }
          } else if tx.send(Event::Tick).is_err() {
            break;
          }
        }
      });
    }

    // Sync registrations from the agent
    tokio::spawn(async move {
      let mut sync_rx = sync_rx;
      while let Some(tag) = sync_rx.recv().await {
        if tx.send(Event::SyncRequested(tag)).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
