//! Generation storage trait and the SQLite/in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::net::Response;

/// A cached response together with the time it was stored.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Summary of one generation, for the status surface.
#[derive(Debug, Clone)]
pub struct GenerationInfo {
  pub version: String,
  pub installed_at: DateTime<Utc>,
  pub entries: usize,
  pub active: bool,
}

/// Storage backend for cache generations.
///
/// Implementations serialize access internally; callers may share a store
/// across tasks. Entries are keyed by request identity with last-writer-wins
/// semantics per key.
pub trait GenerationStore: Send + Sync {
  /// Store one response under `version`, overwriting any prior entry for
  /// the same identity. Creates the generation if it does not exist yet.
  fn put(&self, version: &str, identity: &str, response: &Response) -> Result<()>;

  /// Look up an identity within one generation.
  fn get(&self, version: &str, identity: &str) -> Result<Option<CachedResponse>>;

  /// Create the generation and store every entry in one atomic step.
  /// Used by install so a failed priming never leaves a partial generation.
  fn commit_generation(&self, version: &str, entries: &[(String, Response)]) -> Result<()>;

  /// All known generations, oldest install first.
  fn list_generations(&self) -> Result<Vec<GenerationInfo>>;

  /// Drop a generation and every entry in it.
  fn delete_generation(&self, version: &str) -> Result<()>;

  /// Point the active marker at `version`. Fails if the generation does
  /// not exist.
  fn set_active(&self, version: &str) -> Result<()>;

  /// The version tag lookups are served from, if any generation is active.
  fn active_generation(&self) -> Result<Option<String>>;
}

/// Stable fixed-length row key for a request identity.
fn identity_hash(identity: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(identity.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Schema for the response cache.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    version TEXT PRIMARY KEY,
    installed_at TEXT NOT NULL DEFAULT (datetime('now')),
    active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS response_cache (
    version TEXT NOT NULL,
    identity_hash TEXT NOT NULL,
    identity TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (version, identity_hash)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_version
    ON response_cache(version);
"#;

/// SQLite-backed generation store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::from_connection(conn)
  }

  /// An in-memory store, used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Default database path: `<data dir>/cachesync/cache.db`.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachesync").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl GenerationStore for SqliteStore {
  fn put(&self, version: &str, identity: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (version) VALUES (?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to ensure generation {}: {}", version, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (version, identity_hash, identity, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          version,
          identity_hash(identity),
          identity,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store response for {}: {}", identity, e))?;

    Ok(())
  }

  fn get(&self, version: &str, identity: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM response_cache
         WHERE version = ? AND identity_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache lookup: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![version, identity_hash(identity)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn commit_generation(&self, version: &str, entries: &[(String, Response)]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let committed = (|| -> Result<()> {
      conn.execute(
        "INSERT INTO generations (version) VALUES (?)
         ON CONFLICT(version) DO UPDATE SET installed_at = datetime('now')",
        params![version],
      )?;

      for (identity, response) in entries {
        let headers = serde_json::to_string(&response.headers)?;
        conn.execute(
          "INSERT OR REPLACE INTO response_cache (version, identity_hash, identity, status, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
          params![
            version,
            identity_hash(identity),
            identity,
            response.status,
            headers,
            response.body
          ],
        )?;
      }
      Ok(())
    })();

    match committed {
      Ok(()) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit generation {}: {}", version, e))?;
        Ok(())
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to populate generation {}: {}", version, e))
      }
    }
  }

  fn list_generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT g.version, g.installed_at, g.active, COUNT(rc.identity_hash)
         FROM generations g
         LEFT JOIN response_cache rc ON rc.version = g.version
         GROUP BY g.version
         ORDER BY g.installed_at, g.version",
      )
      .map_err(|e| eyre!("Failed to prepare generation listing: {}", e))?;

    let rows: Vec<(String, String, bool, usize)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(version, installed_at, active, entries)| {
        Ok(GenerationInfo {
          version,
          installed_at: parse_datetime(&installed_at)?,
          entries,
          active,
        })
      })
      .collect()
  }

  fn delete_generation(&self, version: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let result = conn
      .execute(
        "DELETE FROM response_cache WHERE version = ?",
        params![version],
      )
      .and_then(|_| conn.execute("DELETE FROM generations WHERE version = ?", params![version]));
    match result {
      Ok(_) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit delete of {}: {}", version, e))?;
        Ok(())
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to delete generation {}: {}", version, e))
      }
    }
  }

  fn set_active(&self, version: &str) -> Result<()> {
    let conn = self.lock()?;

    // Clear-and-set runs as one transaction: pointing at an uninstalled
    // version rolls back and the prior pointer stays intact.
    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let result = conn.execute("UPDATE generations SET active = 0", []).and_then(|_| {
      conn.execute(
        "UPDATE generations SET active = 1 WHERE version = ?",
        params![version],
      )
    });

    match result {
      Ok(0) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Generation {} is not installed", version))
      }
      Ok(_) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit active pointer: {}", e))?;
        Ok(())
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to set active generation: {}", e))
      }
    }
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT version FROM generations WHERE active = 1 LIMIT 1")
      .map_err(|e| eyre!("Failed to prepare active lookup: {}", e))?;

    let version: Option<String> = stmt.query_row([], |row| row.get(0)).ok();
    Ok(version)
  }
}

#[derive(Debug, Default)]
struct MemoryGeneration {
  installed_at: Option<DateTime<Utc>>,
  entries: HashMap<String, CachedResponse>,
}

#[derive(Debug, Default)]
struct MemoryInner {
  generations: BTreeMap<String, MemoryGeneration>,
  active: Option<String>,
}

/// In-memory generation store. Used in tests and anywhere durability is
/// not wanted; same contract as [`SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: Mutex<MemoryInner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl GenerationStore for MemoryStore {
  fn put(&self, version: &str, identity: &str, response: &Response) -> Result<()> {
    let mut inner = self.lock()?;
    let generation = inner.generations.entry(version.to_string()).or_default();
    generation.entries.insert(
      identity.to_string(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn get(&self, version: &str, identity: &str) -> Result<Option<CachedResponse>> {
    let inner = self.lock()?;
    Ok(
      inner
        .generations
        .get(version)
        .and_then(|g| g.entries.get(identity))
        .cloned(),
    )
  }

  fn commit_generation(&self, version: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut inner = self.lock()?;
    let generation = inner.generations.entry(version.to_string()).or_default();
    generation.installed_at = Some(Utc::now());
    for (identity, response) in entries {
      generation.entries.insert(
        identity.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    }
    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<GenerationInfo>> {
    let inner = self.lock()?;
    Ok(
      inner
        .generations
        .iter()
        .map(|(version, generation)| GenerationInfo {
          version: version.clone(),
          installed_at: generation.installed_at.unwrap_or_else(Utc::now),
          entries: generation.entries.len(),
          active: inner.active.as_deref() == Some(version),
        })
        .collect(),
    )
  }

  fn delete_generation(&self, version: &str) -> Result<()> {
    let mut inner = self.lock()?;
    inner.generations.remove(version);
    if inner.active.as_deref() == Some(version) {
      inner.active = None;
    }
    Ok(())
  }

  fn set_active(&self, version: &str) -> Result<()> {
    let mut inner = self.lock()?;
    if !inner.generations.contains_key(version) {
      return Err(eyre!("Generation {} is not installed", version));
    }
    inner.active = Some(version.to_string());
    Ok(())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let inner = self.lock()?;
    Ok(inner.active.clone())
  }
}
