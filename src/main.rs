use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use garita::api::{ApiClient, ApiQuery, Transit, TransitState};
use garita::config::Config;
use garita::sync::{
  AutoPoller, CacheStore, ConnectionMonitor, Resource, ResourceOptions, Snapshot, SqliteStore,
  Status,
};

#[derive(Parser, Debug)]
#[command(name = "garita")]
#[command(about = "Headless sync monitor for the sealed-transit console")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/garita/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Customs office to filter transits by
  #[arg(short, long)]
  aduana: Option<String>,

  /// Fetch once, report, and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override customs office if specified on command line
  let config = if let Some(aduana) = args.aduana {
    Config {
      default_aduana: Some(aduana),
      ..config
    }
  } else {
    config
  };

  let _log_guard = init_tracing()?;

  let store = match &config.cache.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let cache = CacheStore::new(Arc::new(store));
  let monitor = ConnectionMonitor::new();
  let client = ApiClient::new(&config)?;

  let query = ApiQuery::Transits {
    aduana: config.default_aduana.clone(),
  };
  info!(query = %query.description(), "starting transit monitor");

  let fetch_client = client.clone();
  let aduana = config.default_aduana.clone();
  let transits = Resource::new(
    move |_cancel| {
      let client = fetch_client.clone();
      let aduana = aduana.clone();
      async move { client.get_transits(aduana.as_deref()).await }
    },
    ResourceOptions {
      cache_key: Some(query.cache_key()),
      cache_ttl: config.cache.ttl(),
      ..Default::default()
    },
    &monitor,
    Some(cache.clone()),
  );

  let mut snapshots = transits.subscribe();

  if args.once {
    // Wait for the initial load to settle.
    while matches!(snapshots.borrow().status, Status::Idle | Status::Loading) {
      if snapshots.changed().await.is_err() {
        break;
      }
    }
    report(&snapshots.borrow());
    return Ok(());
  }

  let poll_target = transits.clone();
  let _poller = AutoPoller::new(
    move || {
      let target = poll_target.clone();
      async move {
        target.refetch();
      }
    },
    Duration::from_secs(config.poll.transits_secs),
    true,
    &monitor,
  );

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = snapshots.changed() => {
        if changed.is_err() {
          break;
        }
        report(&snapshots.borrow());
      }
    }
  }

  Ok(())
}

fn report(snapshot: &Snapshot<Vec<Transit>>) {
  match snapshot.status {
    Status::Idle => {}
    Status::Loading => info!("refreshing transits"),
    Status::Success => {
      let transits = snapshot.data.as_deref().unwrap_or_default();
      let listos = transits
        .iter()
        .filter(|t| t.estado == TransitState::Listo)
        .count();
      info!(
        total = transits.len(),
        listos,
        cached = snapshot.is_cached,
        "transits updated"
      );
    }
    Status::Error => {
      let held = snapshot.data.as_ref().map(Vec::len).unwrap_or(0);
      if let Some(error) = &snapshot.error {
        warn!(%error, held, "transit fetch failed");
      }
    }
  }
}

/// Log to stdout and a daily-rolled file under the data directory.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("garita")
    .join("logs");

  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "garita.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("garita=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer())
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}
