//! Command surface and the long-running agent loop.

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::agent::{CacheSyncAgent, UploadOutcome};
use crate::cache::{ResponseSource, SqliteStore};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::export;
use crate::net::{HttpFetcher, Request};
use crate::sync::{ReplayOutcome, SqliteQueue, WriteRequest};

type Agent = CacheSyncAgent<SqliteStore, SqliteQueue, HttpFetcher>;

#[derive(Parser, Debug)]
#[command(name = "cachesync")]
#[command(about = "Offline-first HTTP cache and deferred-write sync agent")]
#[command(version)]
pub struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cachesync/config.yaml)
  #[arg(short, long)]
  pub config: Option<PathBuf>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install the configured generation, activate it, and run the agent loop
  Run,
  /// Fetch the asset manifest into a new generation
  Install,
  /// Evict stale generations and switch lookups to the configured version
  Activate,
  /// Show generations, the active pointer, and queue depth
  Status,
  /// Route one request through the agent and report where the bytes came from
  Fetch {
    /// URL to fetch (absolute, or a path under origin.base_url)
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Submit a write now, or queue it when the backend is unreachable
  Upload {
    /// File whose bytes form the payload
    file: PathBuf,
    /// Target endpoint
    #[arg(long, default_value = "/functions/v1/upload-video")]
    endpoint: String,
    /// MIME type sent with the payload
    #[arg(long)]
    content_type: Option<String>,
    /// Explicit write id (defaults to a content hash)
    #[arg(long)]
    id: Option<String>,
  },
  /// Replay queued writes once, oldest first
  Replay,
  /// Deliver a push payload as a user notification
  Notify {
    /// JSON payload file; `title` and `body` are both optional
    payload: PathBuf,
  },
  /// Render JSON records as CSV or a print-ready report
  Export {
    /// JSON input file
    input: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value = "csv")]
    format: ExportFormat,
    /// Write output here instead of stdout
    #[arg(short, long)]
    out: Option<PathBuf>,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ExportFormat {
  /// An array of flat JSON objects, one CSV row each
  Csv,
  /// `{"athletes": [...], "stats": {...}}` rendered as a print-ready report
  Report,
}

/// Input shape of `export --format report`.
#[derive(Debug, Deserialize)]
struct ReportInput {
  #[serde(default)]
  athletes: Vec<export::AthleteSummary>,
  #[serde(default)]
  stats: export::ReportStats,
}

pub async fn run(args: Args) -> Result<()> {
  match args.command {
    // Export is pure; it runs without a config file.
    Command::Export { input, format, out } => run_export(&input, format, out.as_deref()),
    Command::Run => {
      let config = Config::load(args.config.as_deref())?;
      run_loop(config).await
    }
    Command::Install => {
      let agent = one_shot_agent(args.config.as_deref())?;
      let report = agent.install().await?;
      println!("Installed generation {} ({} entries)", report.version, report.entries);
      Ok(())
    }
    Command::Activate => {
      let agent = one_shot_agent(args.config.as_deref())?;
      let report = agent.activate()?;
      for version in &report.evicted {
        println!("Evicted generation {}", version);
      }
      println!("Activated generation {}", report.version);
      Ok(())
    }
    Command::Status => {
      let agent = one_shot_agent(args.config.as_deref())?;
      print_status(&agent)
    }
    Command::Fetch { url, navigate } => {
      let agent = one_shot_agent(args.config.as_deref())?;
      let url = resolve_url(&agent.settings().base_url, &url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };

      let outcome = agent.handle(&request).await?;
      println!(
        "status {} from {} ({} bytes)",
        outcome.response.status,
        outcome.source.as_str(),
        outcome.response.body.len()
      );
      if outcome.source == ResponseSource::OfflineShell {
        println!("nothing cached for this URL; served the application shell");
      }
      if let Some(cached_at) = outcome.cached_at {
        println!("cached at {}", cached_at.format("%Y-%m-%d %H:%M:%S"));
      }
      Ok(())
    }
    Command::Upload {
      file,
      endpoint,
      content_type,
      id,
    } => {
      let agent = one_shot_agent(args.config.as_deref())?;
      let payload = std::fs::read(&file)
        .map_err(|e| eyre!("Failed to read payload {}: {}", file.display(), e))?;
      let write = match id {
        Some(id) => WriteRequest {
          id,
          endpoint,
          payload,
          content_type,
        },
        None => WriteRequest::with_derived_id(endpoint, payload, content_type),
      };

      match agent.upload(write).await? {
        UploadOutcome::Committed { status } => {
          println!("Upload committed (status {})", status);
        }
        UploadOutcome::Queued => {
          println!("Backend unreachable; upload queued for replay");
        }
        UploadOutcome::QueuedBehind { ahead } => {
          println!(
            "Upload queued behind {} earlier write(s) to preserve submission order",
            ahead
          );
        }
      }
      Ok(())
    }
    Command::Notify { payload } => {
      let agent = one_shot_agent(args.config.as_deref())?;
      let raw = std::fs::read(&payload)
        .map_err(|e| eyre!("Failed to read payload {}: {}", payload.display(), e))?;
      let notification = agent.notify(&raw);
      println!("{}: {}", notification.title, notification.body);
      Ok(())
    }
    Command::Replay => {
      let agent = one_shot_agent(args.config.as_deref())?;
      match agent.replay_pending().await? {
        ReplayOutcome::Completed(report) => {
          println!("Committed {} write(s)", report.committed.len());
          for id in &report.committed {
            println!("  {}", id);
          }
          for id in &report.dead_letters {
            println!("Set aside after repeated failures: {}", id);
          }
          if let Some((id, error)) = &report.stopped_on {
            println!("Stopped on {}: {}", id, error);
          }
          if let Some((id, until)) = &report.deferred {
            println!(
              "{} is backing off until {}",
              id,
              until.format("%Y-%m-%d %H:%M:%S")
            );
          }
        }
        ReplayOutcome::AlreadyRunning => println!("A replay pass is already running"),
      }
      Ok(())
    }
  }
}

/// The long-running companion loop: prime and activate the configured
/// generation, then react to connectivity edges and sync registrations.
async fn run_loop(config: Config) -> Result<()> {
  let (sync_tx, sync_rx) = mpsc::unbounded_channel();
  let agent = Arc::new(build_agent(&config, Some(sync_tx))?);

  // A failed install never replaces what is already active; keep serving
  // the previous generation and try again on the next start.
  match agent.install().await {
    Ok(report) => {
      agent.activate()?;
      tracing::info!(version = %report.version, "serving the configured generation");
    }
    Err(e) => {
      tracing::warn!(error = %e, "install failed, keeping the previously active generation");
    }
  }
  agent.recover_sync_registration()?;

  let probe_agent = agent.clone();
  let mut events = EventHandler::new(
    config.probe_interval(),
    move || {
      let agent = probe_agent.clone();
      async move { agent.probe_origin().await }
    },
    sync_rx,
  );

  let mut online = false;
  while let Some(event) = events.next().await {
    match event {
      Event::Online => {
        online = true;
        tracing::info!("origin reachable");
        replay(&agent).await;
      }
      Event::Offline => {
        online = false;
        tracing::warn!("origin unreachable, serving from cache");
      }
      Event::SyncRequested(tag) => {
        tracing::debug!(tag = %tag, "sync requested");
        if online {
          replay(&agent).await;
        }
      }
      Event::Tick => {
        if !online {
          continue;
        }
        match agent.status() {
          Ok(status) if status.pending > 0 => replay(&agent).await,
          Ok(_) => {}
          Err(e) => tracing::error!(error = %e, "status check failed"),
        }
      }
    }
  }

  Ok(())
}

/// A replay failure must not take the loop down.
async fn replay(agent: &Agent) {
  match agent.replay_pending().await {
    Ok(ReplayOutcome::Completed(report)) => {
      if !report.committed.is_empty() || !report.dead_letters.is_empty() {
        tracing::info!(
          committed = report.committed.len(),
          dead_letters = report.dead_letters.len(),
          "replay pass finished"
        );
      }
    }
    Ok(ReplayOutcome::AlreadyRunning) => {}
    Err(e) => tracing::error!(error = %e, "replay pass failed"),
  }
}

fn one_shot_agent(config_path: Option<&Path>) -> Result<Agent> {
  let config = Config::load(config_path)?;
  build_agent(&config, None)
}

fn build_agent(config: &Config, sync_tx: Option<mpsc::UnboundedSender<String>>) -> Result<Agent> {
  let settings = config.agent_settings()?;

  let store = match &config.cache.db_path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let queue = match &config.sync.db_path {
    Some(path) => SqliteQueue::open_at(path)?,
    None => SqliteQueue::open()?,
  };
  let fetcher = HttpFetcher::new(settings.net_timeout)?;

  let mut agent = CacheSyncAgent::new(settings, store, queue, fetcher);
  if let Some(tx) = sync_tx {
    agent = agent.with_sync_channel(tx);
  }
  Ok(agent)
}

fn print_status(agent: &Agent) -> Result<()> {
  let status = agent.status()?;

  if status.generations.is_empty() {
    println!("No generations installed");
  }
  for generation in &status.generations {
    let marker = if generation.active { "*" } else { " " };
    println!(
      "{} {}  {} entries  installed {}",
      marker,
      generation.version,
      generation.entries,
      generation.installed_at.format("%Y-%m-%d %H:%M:%S")
    );
  }

  println!("Pending writes: {}", status.pending);
  for write in &status.dead_letters {
    println!(
      "Dead letter {} (queued {}, {} attempts): {}",
      write.id,
      write.created_at.format("%Y-%m-%d %H:%M:%S"),
      write.retry_count,
      write.last_error.as_deref().unwrap_or("unknown error")
    );
  }
  Ok(())
}

fn run_export(input: &Path, format: ExportFormat, out: Option<&Path>) -> Result<()> {
  let contents = std::fs::read_to_string(input)
    .map_err(|e| eyre!("Failed to read {}: {}", input.display(), e))?;

  let rendered = match format {
    ExportFormat::Csv => {
      let records: Vec<Map<String, Value>> = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Expected an array of objects in {}: {}", input.display(), e))?;
      export::to_csv(&records)
    }
    ExportFormat::Report => {
      let report: ReportInput = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse report input {}: {}", input.display(), e))?;
      let body = export::report_html(&report.athletes, &report.stats, Utc::now());
      export::print_document("Athlete Performance Report", &body)
    }
  };

  match out {
    Some(path) => std::fs::write(path, rendered)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => println!("{}", rendered),
  }
  Ok(())
}

fn resolve_url(base: &Url, raw: &str) -> Result<Url> {
  if raw.starts_with("http://") || raw.starts_with("https://") {
    Url::parse(raw).map_err(|e| eyre!("Invalid URL {}: {}", raw, e))
  } else {
    base
      .join(raw)
      .map_err(|e| eyre!("Invalid path {}: {}", raw, e))
  }
}
