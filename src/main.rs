use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

use syncline::config::Config;
use syncline::net::probe_loop;
use syncline::queue::{Payload, QueuedChange, Table};
use syncline::remote::RestRemote;
use syncline::storage::SqliteStore;
use syncline::sync::{EventSource, SyncEvent};
use syncline::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "syncline")]
#[command(about = "Offline-first change queue and sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/syncline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show pending/failed counts and connectivity
  Status,
  /// Run one sync pass now
  Sync,
  /// Queue a change
  Queue {
    /// Target table (customers, catalog_items, quotes, quote_items)
    table: String,
    /// Operation: create, update, or delete
    op: String,
    /// Record id
    id: String,
    /// Payload as a JSON object (ignored for delete)
    #[arg(default_value = "{}")]
    payload: String,
  },
  /// Run the engine until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let store = match &config.storage.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let store = match config.storage.max_bytes {
    Some(max_bytes) => store.with_max_bytes(max_bytes),
    None => store,
  };

  let remote_config = config
    .remote
    .clone()
    .ok_or_else(|| eyre!("Config is missing the remote section"))?;
  let remote = Arc::new(RestRemote::new(&remote_config)?);

  let engine = SyncEngine::new(&config, Arc::new(store), remote);

  match args.command {
    Command::Status => {
      let status = engine.status();
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Sync => {
      engine.sync_now().await;
      let status = engine.status();
      println!("{} pending, {} failed", status.pending, status.failed);
    }
    Command::Queue {
      table,
      op,
      id,
      payload,
    } => {
      let table: Table = table.parse().map_err(|e: String| eyre!(e))?;
      let payload: Payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Payload must be a JSON object: {}", e))?;

      let change = match op.as_str() {
        "create" => QueuedChange::create(table, id, payload),
        "update" => QueuedChange::update(table, id, payload),
        "delete" => QueuedChange::delete(table, id),
        other => return Err(eyre!("Unknown operation: {}", other)),
      };

      engine.queue_change(change);
      println!("{} pending", engine.status().pending);
    }
    Command::Run => {
      let (tx, events) = EventSource::standard(
        config.sync_interval(),
        config.flush_interval(),
        engine.connectivity().subscribe(),
      );

      // Keep the connectivity monitor honest with a periodic probe
      let probe_url = Url::parse(&remote_config.url)
        .map_err(|e| eyre!("Invalid remote url {}: {}", remote_config.url, e))?;
      tokio::spawn(probe_loop(
        engine.connectivity().clone(),
        reqwest::Client::new(),
        probe_url,
        config.sync_interval(),
      ));

      tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(SyncEvent::Shutdown);
      });

      engine.run(events).await;
    }
  }

  Ok(())
}
