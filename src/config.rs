use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::agent::AgentSettings;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub origin: OriginConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
  /// Base URL manifest entries and the offline shell resolve against.
  pub base_url: String,
  /// Path prefix of backend API requests. Requests under it are never
  /// cached, in either direction.
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version tag of the generation this deployment serves.
  #[serde(default = "default_version")]
  pub version: String,
  /// Critical assets primed at install time.
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Explicit cache database path (defaults to the user data directory).
  #[serde(default)]
  pub db_path: Option<PathBuf>,
  /// Seconds before a network attempt is abandoned.
  #[serde(default = "default_net_timeout_secs")]
  pub net_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      manifest: default_manifest(),
      db_path: None,
      net_timeout_secs: default_net_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Tag registered for background replay of queued uploads.
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  /// Failed attempts before a write is set aside as a dead letter.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Backoff after the first failure, in seconds. Doubles per attempt.
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  /// Upper bound on the backoff, in seconds.
  #[serde(default = "default_backoff_cap_secs")]
  pub backoff_cap_secs: u64,
  /// Explicit queue database path (defaults to the user data directory).
  #[serde(default)]
  pub db_path: Option<PathBuf>,
  /// Seconds between connectivity probes in the agent loop.
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      max_retries: default_max_retries(),
      backoff_base_secs: default_backoff_base_secs(),
      backoff_cap_secs: default_backoff_cap_secs(),
      db_path: None,
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

fn default_api_prefix() -> String {
  "/functions/v1/".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_manifest() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/styles/globals.css".to_string(),
  ]
}

fn default_net_timeout_secs() -> u64 {
  10
}

fn default_sync_tag() -> String {
  "upload-videos".to_string()
}

fn default_max_retries() -> u32 {
  5
}

fn default_backoff_base_secs() -> u64 {
  30
}

fn default_backoff_cap_secs() -> u64 {
  3600
}

fn default_probe_interval_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cachesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachesync/config.yaml
  /// 4. ~/.config/cachesync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/cachesync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cachesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks CACHESYNC_API_TOKEN. Deferred uploads go out without a bearer
  /// header when it is unset.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CACHESYNC_API_TOKEN").ok()
  }

  pub fn agent_settings(&self) -> Result<AgentSettings> {
    let base_url = Url::parse(&self.origin.base_url)
      .map_err(|e| eyre!("Invalid origin.base_url {}: {}", self.origin.base_url, e))?;

    Ok(AgentSettings {
      version: self.cache.version.clone(),
      base_url,
      manifest: self.cache.manifest.clone(),
      api_prefix: self.origin.api_prefix.clone(),
      sync_tag: self.sync.tag.clone(),
      net_timeout: Duration::from_secs(self.cache.net_timeout_secs),
      retry: RetryPolicy {
        max_retries: self.sync.max_retries,
        backoff_base: Duration::from_secs(self.sync.backoff_base_secs),
        backoff_cap: Duration::from_secs(self.sync.backoff_cap_secs),
      },
      api_token: Self::get_api_token(),
    })
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs)
  }
}
