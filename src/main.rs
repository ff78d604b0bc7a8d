use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use portal_offline::cache::SqliteStorage;
use portal_offline::connectivity::ConnectivityMonitor;
use portal_offline::event::{Event, EventHandler};
use portal_offline::http::{resolve, Destination, Request};
use portal_offline::network::{HttpNetwork, Network};
use portal_offline::outbox::{OutboxRecord, OutboxStore};
use portal_offline::sync::{SyncOutcome, SyncTrigger};
use portal_offline::{logging, Config, OfflineWorker};

#[derive(Parser, Debug)]
#[command(name = "portal-offline")]
#[command(about = "Offline cache and order outbox for the B2B portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/portal-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Portal origin to use
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision the configured cache version
  Install,
  /// Activate the configured cache version and drop older ones
  Activate,
  /// Fetch a URL through the offline layer
  Fetch {
    /// Absolute URL or path on the portal origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, value_enum, default_value_t = Destination::Empty)]
    destination: Destination,
  },
  /// Submit an order (JSON file, or - for stdin)
  Order { file: PathBuf },
  /// List orders waiting for sync
  Pending,
  /// List orders the server kept rejecting
  DeadLetters,
  /// Move a dead-lettered order back to the queue
  Requeue { id: i64 },
  /// Run a sync pass now
  Sync {
    #[arg(long, default_value = "manual-sync-trigger")]
    tag: String,
  },
  /// Run the worker, syncing whenever the portal becomes reachable again
  Watch,
  /// List cache generations
  Namespaces,
}

type Worker = OfflineWorker<SqliteStorage>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    let config = Config { origin, ..config };
    config.origin_url()?;
    config
  } else {
    config
  };

  let data_dir = config.data_dir()?;
  let _guard = logging::init(&data_dir)?;

  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(&config.network)?);
  let storage = SqliteStorage::open(&data_dir.join("cache.db"))
    .map_err(|e| eyre!("Failed to open cache: {}", e))?;
  let outbox = OutboxStore::open(&data_dir.join("outbox.db"))
    .map_err(|e| eyre!("Failed to open outbox: {}", e))?;
  let worker = Arc::new(OfflineWorker::new(config, storage, outbox, network.clone())?);

  match args.command {
    Command::Install => install(&worker).await,
    Command::Activate => {
      let report = worker.activate().await?;
      println!("active: {}", report.active);
      for name in report.removed {
        println!("removed: {}", name);
      }
      Ok(())
    }
    Command::Fetch {
      url,
      navigate,
      destination,
    } => fetch(&worker, &url, navigate, destination).await,
    Command::Order { file } => order(&worker, &file).await,
    Command::Pending => {
      let records = worker
        .outbox()
        .list_pending()
        .collect::<Result<Vec<_>, _>>()?;
      print_records(&records)
    }
    Command::DeadLetters => print_records(&worker.outbox().dead_letters()?),
    Command::Requeue { id } => {
      worker.outbox().requeue(id)?;
      println!("requeued {}", id);
      Ok(())
    }
    Command::Sync { tag } => sync(&worker, &tag).await,
    Command::Watch => watch(worker, network).await,
    Command::Namespaces => {
      for ns in worker.cache().namespaces()? {
        let marker = if ns.active { "*" } else { " " };
        let state = if ns.installed { "" } else { ", incomplete" };
        println!("{} {} ({} entries{})", marker, ns.name, ns.entries, state);
      }
      Ok(())
    }
  }
}

async fn install(worker: &Worker) -> Result<()> {
  let report = worker.install().await?;
  println!(
    "{}: {} stored, {} failed",
    report.namespace,
    report.stored.len(),
    report.failed.len()
  );
  for (url, reason) in &report.failed {
    println!("  {}: {}", url, reason);
  }
  Ok(())
}

async fn fetch(worker: &Worker, target: &str, navigate: bool, destination: Destination) -> Result<()> {
  let url = resolve(worker.cache().origin(), target)
    .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))?;
  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url).with_destination(destination)
  };

  let response = worker.fetch(&request).await?;
  eprintln!("{} ({:?})", response.status, response.source);
  println!("{}", response.text());
  Ok(())
}

async fn order(worker: &Worker, file: &Path) -> Result<()> {
  let contents = if file == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .map_err(|e| eyre!("Failed to read order from stdin: {}", e))?;
    buf
  } else {
    std::fs::read_to_string(file)
      .map_err(|e| eyre!("Failed to read order file {}: {}", file.display(), e))?
  };
  let payload: serde_json::Value =
    serde_json::from_str(&contents).map_err(|e| eyre!("Order is not valid JSON: {}", e))?;

  let orders_path = &worker.config().orders_path;
  let url = resolve(worker.cache().origin(), orders_path)
    .map_err(|e| eyre!("Invalid orders path '{}': {}", orders_path, e))?;

  let response = worker.fetch(&Request::post_json(url, &payload)).await?;
  println!("{} {}", response.status, response.text());
  Ok(())
}

async fn sync(worker: &Worker, tag: &str) -> Result<()> {
  match worker.sync(&SyncTrigger::new(tag)).await? {
    SyncOutcome::Completed(report) => {
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
    SyncOutcome::AlreadyDraining => println!("a sync pass is already running"),
    SyncOutcome::Ignored => println!("tag '{}' does not trigger a sync", tag),
  }
  Ok(())
}

fn print_records(records: &[OutboxRecord]) -> Result<()> {
  for record in records {
    println!("{}", serde_json::to_string(record)?);
  }
  Ok(())
}

async fn watch(worker: Arc<Worker>, network: Arc<dyn Network>) -> Result<()> {
  let config = worker.config();
  let probe_url = resolve(worker.cache().origin(), &config.sync.probe_path)
    .map_err(|e| eyre!("Invalid probe path '{}': {}", config.sync.probe_path, e))?;

  let (tx, events) = EventHandler::channel();
  let monitor = ConnectivityMonitor::new(
    network,
    probe_url,
    Duration::from_secs(config.sync.probe_interval_secs),
    &config.sync.restoration_tag,
  )
  .spawn(tx.clone());

  // Print everything the worker tells its clients
  let mut inbox = worker.clients().subscribe();
  tokio::spawn(async move {
    while let Ok(message) = inbox.recv().await {
      if let Ok(line) = serde_json::to_string(&message) {
        println!("{}", line);
      }
    }
  });

  tx.send(Event::Install)
    .map_err(|_| eyre!("Event queue closed"))?;
  tx.send(Event::Activate)
    .map_err(|_| eyre!("Event queue closed"))?;

  info!(origin = %worker.cache().origin(), "Watching for connectivity changes");
  tokio::select! {
    _ = worker.clone().run(events) => {}
    _ = tokio::signal::ctrl_c() => info!("Shutting down"),
  }

  monitor.abort();
  Ok(())
}
