mod cache;
mod clients;
mod config;
mod connectivity;
mod db;
mod error;
mod http;
mod kv;
mod lifecycle;
mod messages;
mod network;
mod policy;
mod queue;
mod sync;
mod tasks;
#[cfg(test)]
mod testutil;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCEPT;
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use crate::connectivity::ConnectivityMonitor;
use crate::http::{Destination, Request};
use crate::lifecycle::WorkerState;
use crate::network::{CacheMode, Fetcher, HttpFetcher};
use crate::policy::Interception;
use crate::sync::{SimulatedReplayer, SyncRecord, LAST_ERROR_KEY, LAST_SUCCESS_KEY};
use crate::worker::{EventOutcome, MessageOutcome, ServiceWorker, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "agri-offline")]
#[command(about = "Offline cache tiers and sync queue for the farm-management app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/agri-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin of the controlled application
  #[arg(long)]
  origin: Option<Url>,

  /// Directory for the cache and queue databases
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Keep caches and queue in memory only
  #[arg(long)]
  ephemeral: bool,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the app shell into the current static generation
  Install,
  /// Purge superseded cache generations and take control
  Activate,
  /// Resolve one request through the cache/network policy
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
    /// Request destination (script, style, image, font, document, manifest)
    #[arg(long)]
    destination: Option<Destination>,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Write the response body to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Inspect or modify the offline action queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Fire a deferred sync now
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show worker, cache and queue state
  Status,
  /// Act as a long-running worker; JSON messages on stdin, notifications on stdout
  Run,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue an action as an application instance would
  Add {
    action: String,
    /// JSON payload
    data: Option<String>,
  },
  List,
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin and data dir if specified on command line
  let config = config::Config {
    origin: args.origin.unwrap_or(config.origin),
    data_dir: args.data_dir.or(config.data_dir),
    ..config
  };

  let data_dir = config.data_dir()?;
  let _log_guard = init_logging(&data_dir, args.verbose)?;

  let fetcher = Arc::new(HttpFetcher::new(None)?);
  let replayer = Arc::new(SimulatedReplayer);
  let worker = Arc::new(if args.ephemeral {
    ServiceWorker::in_memory(&config, fetcher.clone(), replayer)?
  } else {
    ServiceWorker::open(&config, &data_dir, fetcher.clone(), replayer)?
  });

  match args.command {
    Command::Install => {
      if let EventOutcome::Installed(report) = worker.handle(WorkerEvent::Install).await? {
        println!(
          "installed {}: {} cached, {} failed",
          report.cache,
          report.precache.cached.len(),
          report.precache.failed.len()
        );
        for (path, reason) in &report.precache.failed {
          println!("  failed {}: {}", path, reason);
        }
      }
    }
    Command::Activate => {
      if let EventOutcome::Activated(report) = worker.handle(WorkerEvent::Activate).await? {
        println!(
          "activated: purged [{}], claimed {}",
          report.purged.join(", "),
          report.claimed
        );
      }
    }
    Command::Fetch {
      url,
      navigate,
      accept,
      destination,
      method,
      output,
    } => {
      let url = config.origin.join(&url)?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      }
      .with_method(method);
      if let Some(accept) = accept {
        request = request.with_header(ACCEPT, &accept);
      }
      if let Some(destination) = destination {
        request = request.with_destination(destination);
      }

      run_fetch(&worker, fetcher.as_ref(), request, output.as_deref()).await?;
    }
    Command::Queue { command } => run_queue(&worker, command).await?,
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      if let EventOutcome::Synced(outcome) = worker.handle(WorkerEvent::Sync { tag }).await? {
        println!("{}", outcome);
      }
    }
    Command::Status => print_status(&worker)?,
    Command::Run => run_worker(&config, worker).await?,
  }

  Ok(())
}

fn init_logging(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "agri-offline.log"));

  let default_level = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_env("AGRI_OFFLINE_LOG")
    .unwrap_or_else(|_| EnvFilter::new(default_level));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact(),
    )
    .init();

  Ok(guard)
}

async fn run_fetch(
  worker: &ServiceWorker,
  fetcher: &dyn Fetcher,
  request: Request,
  output: Option<&Path>,
) -> Result<()> {
  let (response, source) = match worker.handle(WorkerEvent::Fetch(request.clone())).await? {
    EventOutcome::Fetch(Interception::Respond(resolved)) => {
      (resolved.response, format!("{:?}", resolved.source).to_lowercase())
    }
    EventOutcome::Fetch(Interception::Passthrough) => (
      fetcher.fetch(&request, CacheMode::Default).await?,
      "passthrough".to_string(),
    ),
    EventOutcome::Fetch(Interception::Failed(e)) => return Err(e.into()),
    other => return Err(eyre!("Unexpected outcome {:?}", other)),
  };
  worker.settle().await;

  println!(
    "{} ({}) {} {} bytes",
    response.status,
    source,
    response.content_type().unwrap_or("-"),
    response.body.len()
  );

  if let Some(path) = output {
    std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
  }
  Ok(())
}

async fn run_queue(worker: &ServiceWorker, command: QueueCommand) -> Result<()> {
  match command {
    QueueCommand::Add { action, data } => {
      let data: serde_json::Value = match data {
        Some(raw) => serde_json::from_str(&raw)?,
        None => serde_json::Value::Null,
      };
      let (id, _rx) = worker.clients().connect().await;
      let message = serde_json::json!({ "type": "QUEUE_SYNC", "action": action, "data": data });
      let outcome = worker
        .handle(WorkerEvent::Message {
          source: id,
          data: message,
        })
        .await?;
      worker.clients().disconnect(id).await;
      match outcome {
        EventOutcome::Message(MessageOutcome::Queued { id, registered }) => {
          let armed = if registered { "armed" } else { "not armed" };
          println!("queued action {} (deferred sync {})", id, armed);
        }
        EventOutcome::Message(MessageOutcome::QueueFailed { error }) => {
          return Err(eyre!("Failed to queue action: {}", error));
        }
        other => return Err(eyre!("Unexpected outcome {:?}", other)),
      }
    }
    QueueCommand::List => {
      for item in worker.queue().drain_all()? {
        println!("{}", serde_json::to_string(&item)?);
      }
    }
    QueueCommand::Clear => {
      println!("removed {} queued actions", worker.queue().clear_all()?);
    }
  }
  Ok(())
}

fn print_status(worker: &ServiceWorker) -> Result<()> {
  let generation = worker.tiers().generation();
  println!("worker: {}", worker.lifecycle().state());
  let settings = worker.kv().keys()?;
  if !settings.is_empty() {
    println!("stored keys: [{}]", settings.join(", "));
  }
  println!(
    "generation: {} / {}",
    generation.static_name, generation.runtime_name
  );

  for name in worker.tiers().cache_names()? {
    let cache = worker.tiers().open(&name)?;
    let marker = if generation.names().contains(&name.as_str()) {
      ""
    } else {
      " (stale)"
    };
    println!("cache {}: {} entries{}", name, cache.len()?, marker);
  }

  if !worker.queue().is_available() {
    println!("queue: unavailable");
  } else {
    match worker.queue().len() {
      Ok(len) => println!("queue: {} pending", len),
      Err(e) => println!("queue: {}", e),
    }
  }
  println!("sync: {:?}", worker.sync_state());
  println!("armed syncs: [{}]", worker.registry().pending().join(", "));

  if let Some(record) = worker.kv().get::<SyncRecord>(LAST_SUCCESS_KEY)? {
    println!("last sync: {} actions at {}", record.count, record.at);
  }
  if let Some(record) = worker.kv().get::<SyncRecord>(LAST_ERROR_KEY)? {
    println!(
      "last sync error: {} at {}",
      record.error.unwrap_or_default(),
      record.at
    );
  }
  Ok(())
}

async fn run_worker(config: &config::Config, worker: Arc<ServiceWorker>) -> Result<()> {
  if worker.lifecycle().state() != WorkerState::Activated {
    worker.handle(WorkerEvent::Install).await?;
    if worker.lifecycle().ready_to_activate().await {
      worker.handle(WorkerEvent::Activate).await?;
    }
  }

  // This process acts as one application instance
  let (instance, mut notifications) = worker.clients().connect().await;
  worker.clients().claim().await;

  tokio::spawn(async move {
    while let Some(message) = notifications.recv().await {
      match serde_json::to_string(&message) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode notification: {}", e),
      }
    }
  });

  let probe_fetcher = Arc::new(HttpFetcher::new(Some(Duration::from_secs(
    config.connectivity.timeout_secs,
  )))?);
  let monitor = ConnectivityMonitor::new(
    probe_fetcher,
    config.probe_url(),
    Duration::from_secs(config.connectivity.interval_secs.max(1)),
  );
  let sync_worker = Arc::clone(&worker);
  let connectivity = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(monitor.interval());
    loop {
      ticker.tick().await;
      for outcome in sync_worker.poll_connectivity(&monitor).await {
        info!("Deferred sync: {}", outcome);
      }
      debug!("Connectivity {}", monitor.state());
    }
  });

  info!("Worker running as {}", instance);
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else { break };
        if line.trim().is_empty() {
          continue;
        }
        match serde_json::from_str(&line) {
          Ok(data) => {
            let outcome = worker
              .handle(WorkerEvent::Message { source: instance, data })
              .await?;
            info!("Handled message: {:?}", outcome);
          }
          Err(e) => warn!("Ignoring malformed message: {}", e),
        }
      }
      _ = tokio::signal::ctrl_c() => {
        info!("Interrupted, shutting down");
        break;
      }
    }
  }

  connectivity.abort();
  worker.settle().await;
  worker.clients().disconnect(instance).await;
  Ok(())
}
