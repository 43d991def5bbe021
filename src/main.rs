mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tally::cache::{CacheStorage, NoopStorage, SqliteStorage};
use tally::realtime::{PollingOnly, PushTransport};
use tally::remote::{MemoryBackend, RemoteStore, RestRemote};
use tally::{ResourceKind, SyncEngine};

const DEMO_OWNER: &str = "demo";

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Tasks and a personal ledger, cached locally and kept in sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tally/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User id whose rows to work with
  #[arg(short, long)]
  owner: Option<String>,

  /// Run against an in-process backend seeded with sample rows
  #[arg(long)]
  memory: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log.filter)?;

  let owner = args
    .owner
    .or_else(|| config.owner.clone())
    .or_else(|| args.memory.then(|| DEMO_OWNER.to_string()))
    .ok_or_else(|| eyre!("No owner given. Pass --owner or set `owner` in the config file."))?;

  let engine = build_engine(&config, args.memory, &owner)?;
  engine.start();

  let result = commands::run(&engine, &owner, args.command).await;

  engine.stop();
  result
}

fn build_engine(config: &config::Config, memory: bool, owner: &str) -> Result<SyncEngine> {
  let engine_config = config.engine_config();

  if memory {
    info!("using in-process backend for {}", owner);
    let backend = Arc::new(MemoryBackend::new());
    seed_demo(&backend, owner);
    let remote: Arc<dyn RemoteStore> = backend.clone();
    let transport: Arc<dyn PushTransport> = backend;
    return Ok(SyncEngine::new(engine_config, remote, transport));
  }

  let mut remote = RestRemote::new(config.backend_url()?, config::Config::get_api_key()?)?;
  if let Some(token) = config::Config::get_access_token() {
    remote = remote.with_access_token(token);
  }
  let storage: Arc<dyn CacheStorage> = if config.cache.persist {
    Arc::new(SqliteStorage::open()?)
  } else {
    Arc::new(NoopStorage)
  };
  info!("using backend {} for {}", config.backend_url()?, owner);

  Ok(SyncEngine::with_storage(
    engine_config,
    Arc::new(remote),
    Arc::new(PollingOnly),
    storage,
  ))
}

fn seed_demo(backend: &MemoryBackend, owner: &str) {
  let food = backend.seed(ResourceKind::Category, owner, json!({ "name": "Food", "color": "#e67e22" }));
  backend.seed(ResourceKind::Category, owner, json!({ "name": "Rent", "color": "#2980b9" }));
  backend.seed(
    ResourceKind::LedgerEntry,
    owner,
    json!({ "amount": 2400.0, "type": "income", "note": "salary", "occurred_on": "2026-10-01" }),
  );
  backend.seed(
    ResourceKind::LedgerEntry,
    owner,
    json!({ "amount": 18.4, "type": "expense", "category_id": food.id, "note": "lunch", "occurred_on": "2026-10-14" }),
  );
  backend.seed(ResourceKind::Task, owner, json!({ "title": "Pay rent", "done": false, "due_on": "2026-11-01" }));
  backend.seed(ResourceKind::Task, owner, json!({ "title": "Renew passport", "done": true }));
  backend.seed(ResourceKind::Profile, owner, json!({ "display_name": "Demo user", "currency": "EUR" }));
}
