//! Durable queue of deferred writes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

/// Lifecycle of a deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
  /// Waiting for a replay pass.
  Queued,
  /// Currently being submitted to the backend.
  InFlight,
  /// At least one attempt failed. Still replayed until the retry cap.
  Failed,
  /// The backend acknowledged the write; it leaves the queue.
  Committed,
}

impl WriteStatus {
  pub const fn as_str(&self) -> &'static str {
    match self {
      WriteStatus::Queued => "queued",
      WriteStatus::InFlight => "in_flight",
      WriteStatus::Failed => "failed",
      WriteStatus::Committed => "committed",
    }
  }

  pub fn from_str_checked(s: &str) -> Option<Self> {
    match s {
      "queued" => Some(WriteStatus::Queued),
      "in_flight" => Some(WriteStatus::InFlight),
      "failed" => Some(WriteStatus::Failed),
      "committed" => Some(WriteStatus::Committed),
      _ => None,
    }
  }
}

impl std::fmt::Display for WriteStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Enqueue-side input: the write id, its target, and the payload.
/// The queue assigns position and timestamps.
#[derive(Debug, Clone)]
pub struct WriteRequest {
  /// Logical operation id. Enqueuing the same id twice is a no-op.
  pub id: String,
  /// Target endpoint: a path under the origin, or an absolute URL.
  pub endpoint: String,
  pub payload: Vec<u8>,
  pub content_type: Option<String>,
}

impl WriteRequest {
  /// Build a request whose id is derived from endpoint and payload, so
  /// resubmitting the same upload collapses to one queue entry.
  pub fn with_derived_id(
    endpoint: impl Into<String>,
    payload: Vec<u8>,
    content_type: Option<String>,
  ) -> Self {
    let endpoint = endpoint.into();
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(&payload);
    let id = hex::encode(hasher.finalize());
    Self {
      id,
      endpoint,
      payload,
      content_type,
    }
  }
}

/// One deferred write as held by the queue.
#[derive(Debug, Clone)]
pub struct PendingWrite {
  pub id: String,
  pub endpoint: String,
  pub payload: Vec<u8>,
  pub content_type: Option<String>,
  pub created_at: DateTime<Utc>,
  /// FIFO position; replay order is ascending seq.
  pub seq: i64,
  pub retry_count: u32,
  pub status: WriteStatus,
  /// Backoff gate: the write is not replayed before this instant.
  pub not_before: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

/// Storage backend for the deferred-write queue.
///
/// `max_retries` defines the terminal boundary: a write whose retry count
/// has reached it is a dead letter, excluded from replay but kept for
/// inspection.
pub trait WriteQueue: Send + Sync {
  /// Idempotent append. Returns true when the write was inserted, false
  /// when the id was already queued.
  fn enqueue(&self, write: &WriteRequest) -> Result<bool>;

  /// The oldest non-terminal write, if any. Backoff gates are not applied
  /// here; the replay pass inspects them so the ordering rule stays in
  /// one place.
  fn next_pending(&self, max_retries: u32) -> Result<Option<PendingWrite>>;

  fn mark_in_flight(&self, id: &str) -> Result<()>;

  /// The backend acknowledged the write: remove it from the queue.
  fn mark_committed(&self, id: &str) -> Result<()>;

  /// Record a failed attempt: bump the retry count, remember the error,
  /// and set the backoff gate (None for writes that just went terminal).
  fn mark_failed(&self, id: &str, error: &str, not_before: Option<DateTime<Utc>>) -> Result<()>;

  /// Writes still eligible for replay (gated ones included).
  fn pending_count(&self, max_retries: u32) -> Result<usize>;

  /// Writes that exhausted their retries, oldest first.
  fn dead_letters(&self, max_retries: u32) -> Result<Vec<PendingWrite>>;

  /// Every write in the queue, oldest first.
  fn all(&self) -> Result<Vec<PendingWrite>>;
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Format a datetime for storage, matching SQLite's `datetime('now')`.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Schema for the deferred-write queue.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_writes (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    endpoint TEXT NOT NULL,
    payload BLOB NOT NULL,
    content_type TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    retry_count INTEGER NOT NULL DEFAULT 0,
    not_before TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_pending_writes_seq ON pending_writes(seq);
"#;

/// SQLite-backed write queue.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  /// Open or create the queue at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    Self::from_connection(conn)
  }

  /// Open or create the queue at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    Self::from_connection(conn)
  }

  /// An in-memory queue, used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.recover()?;
    Ok(queue)
  }

  /// Default database path: `<data dir>/cachesync/sync.db`.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachesync").join("sync.db"))
  }

  /// Writes left in-flight by a crashed replay pass go back to queued.
  fn recover(&self) -> Result<()> {
    let conn = self.lock()?;
    let recovered = conn
      .execute(
        "UPDATE pending_writes SET status = 'queued' WHERE status = 'in_flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to recover in-flight writes: {}", e))?;
    if recovered > 0 {
      tracing::warn!(recovered, "recovered in-flight writes from a previous run");
    }
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

type WriteRow = (
  String,
  i64,
  String,
  Vec<u8>,
  Option<String>,
  String,
  u32,
  Option<String>,
  Option<String>,
  String,
);

fn write_from_row(row: WriteRow) -> Result<PendingWrite> {
  let (id, seq, endpoint, payload, content_type, status, retry_count, not_before, last_error, created_at) =
    row;
  Ok(PendingWrite {
    id,
    endpoint,
    payload,
    content_type,
    created_at: parse_datetime(&created_at)?,
    seq,
    retry_count,
    status: WriteStatus::from_str_checked(&status)
      .ok_or_else(|| eyre!("Unknown write status '{}'", status))?,
    not_before: not_before.as_deref().map(parse_datetime).transpose()?,
    last_error,
  })
}

impl SqliteQueue {
  fn query_writes(&self, where_clause: &str, max_retries: Option<u32>) -> Result<Vec<PendingWrite>> {
    let conn = self.lock()?;

    let sql = format!(
      "SELECT id, seq, endpoint, payload, content_type, status, retry_count, not_before, last_error, created_at
       FROM pending_writes {} ORDER BY seq",
      where_clause
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<WriteRow> {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
      ))
    };
    let rows: Vec<WriteRow> = match max_retries {
      Some(max) => stmt.query_map(params![max], map_row),
      None => stmt.query_map([], map_row),
    }
    .map_err(|e| eyre!("Failed to query writes: {}", e))?
    .filter_map(|r| r.ok())
    .collect();

    rows.into_iter().map(write_from_row).collect()
  }
}

impl WriteQueue for SqliteQueue {
  fn enqueue(&self, write: &WriteRequest) -> Result<bool> {
    let conn = self.lock()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO pending_writes (id, seq, endpoint, payload, content_type)
         VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM pending_writes), ?, ?, ?)",
        params![write.id, write.endpoint, write.payload, write.content_type],
      )
      .map_err(|e| eyre!("Failed to enqueue write {}: {}", write.id, e))?;
    Ok(inserted > 0)
  }

  fn next_pending(&self, max_retries: u32) -> Result<Option<PendingWrite>> {
    Ok(
      self
        .query_writes("WHERE retry_count < ?", Some(max_retries))?
        .into_iter()
        .next(),
    )
  }

  fn mark_in_flight(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE pending_writes SET status = 'in_flight' WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark write {} in-flight: {}", id, e))?;
    Ok(())
  }

  fn mark_committed(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove committed write {}: {}", id, e))?;
    Ok(())
  }

  fn mark_failed(&self, id: &str, error: &str, not_before: Option<DateTime<Utc>>) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE pending_writes
         SET status = 'failed', retry_count = retry_count + 1, last_error = ?, not_before = ?
         WHERE id = ?",
        params![error, not_before.map(format_datetime), id],
      )
      .map_err(|e| eyre!("Failed to mark write {} failed: {}", id, e))?;
    Ok(())
  }

  fn pending_count(&self, max_retries: u32) -> Result<usize> {
    let conn = self.lock()?;
    let count: usize = conn
      .query_row(
        "SELECT COUNT(*) FROM pending_writes WHERE retry_count < ?",
        params![max_retries],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count pending writes: {}", e))?;
    Ok(count)
  }

  fn dead_letters(&self, max_retries: u32) -> Result<Vec<PendingWrite>> {
    self.query_writes("WHERE retry_count >= ?", Some(max_retries))
  }

  fn all(&self) -> Result<Vec<PendingWrite>> {
    self.query_writes("", None)
  }
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
  writes: Vec<PendingWrite>,
  next_seq: i64,
}

/// In-memory write queue with the same contract as [`SqliteQueue`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
  inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryQueueInner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl WriteQueue for MemoryQueue {
  fn enqueue(&self, write: &WriteRequest) -> Result<bool> {
    let mut inner = self.lock()?;
    if inner.writes.iter().any(|w| w.id == write.id) {
      return Ok(false);
    }
    inner.next_seq += 1;
    let seq = inner.next_seq;
    inner.writes.push(PendingWrite {
      id: write.id.clone(),
      endpoint: write.endpoint.clone(),
      payload: write.payload.clone(),
      content_type: write.content_type.clone(),
      created_at: Utc::now(),
      seq,
      retry_count: 0,
      status: WriteStatus::Queued,
      not_before: None,
      last_error: None,
    });
    Ok(true)
  }

  fn next_pending(&self, max_retries: u32) -> Result<Option<PendingWrite>> {
    let inner = self.lock()?;
    Ok(
      inner
        .writes
        .iter()
        .filter(|w| w.retry_count < max_retries)
        .min_by_key(|w| w.seq)
        .cloned(),
    )
  }

  fn mark_in_flight(&self, id: &str) -> Result<()> {
    let mut inner = self.lock()?;
    if let Some(write) = inner.writes.iter_mut().find(|w| w.id == id) {
      write.status = WriteStatus::InFlight;
    }
    Ok(())
  }

  fn mark_committed(&self, id: &str) -> Result<()> {
    let mut inner = self.lock()?;
    inner.writes.retain(|w| w.id != id);
    Ok(())
  }

  fn mark_failed(&self, id: &str, error: &str, not_before: Option<DateTime<Utc>>) -> Result<()> {
    let mut inner = self.lock()?;
    if let Some(write) = inner.writes.iter_mut().find(|w| w.id == id) {
      write.status = WriteStatus::Failed;
      write.retry_count += 1;
      write.last_error = Some(error.to_string());
      write.not_before = not_before;
    }
    Ok(())
  }

  fn pending_count(&self, max_retries: u32) -> Result<usize> {
    let inner = self.lock()?;
    Ok(
      inner
        .writes
        .iter()
        .filter(|w| w.retry_count < max_retries)
        .count(),
    )
  }

  fn dead_letters(&self, max_retries: u32) -> Result<Vec<PendingWrite>> {
    let inner = self.lock()?;
    let mut dead: Vec<PendingWrite> = inner
      .writes
      .iter()
      .filter(|w| w.retry_count >= max_retries)
      .cloned()
      .collect();
    dead.sort_by_key(|w| w.seq);
    Ok(dead)
  }

  fn all(&self) -> Result<Vec<PendingWrite>> {
    let inner = self.lock()?;
    let mut writes = inner.writes.clone();
    writes.sort_by_key(|w| w.seq);
    Ok(writes)
  }
}
