//! The worker: one dispatch table from event kind to handler.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, CacheTierManager, SqliteStorage};
use crate::clients::{ClientRegistry, InstanceId};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{LifecycleError, StorageError};
use crate::http::Request;
use crate::kv::KvStore;
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleController};
use crate::messages::InboundMessage;
use crate::network::DynFetcher;
use crate::policy::{FetchPolicy, Interception};
use crate::queue::QueueStore;
use crate::sync::{
  DeferredSyncRegistry, Replayer, SyncOrchestrator, SyncOutcome, SyncRegistrar, SyncState,
  SyncTrigger,
};
use crate::tasks::BackgroundTasks;

#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  /// Deferred sync fired by the platform
  Sync { tag: String },
  /// Raw post-message payload from an instance
  Message { source: InstanceId, data: Value },
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Fetch(Interception),
  Synced(SyncOutcome),
  Message(MessageOutcome),
}

#[derive(Debug, PartialEq)]
pub enum MessageOutcome {
  /// Stored; `registered` says whether a deferred replay was armed
  Queued { id: i64, registered: bool },
  /// The queue store rejected the action
  QueueFailed { error: String },
  Synced(SyncOutcome),
  SkipWaiting,
  Ignored,
}

pub struct ServiceWorker {
  tiers: Arc<CacheTierManager>,
  policy: FetchPolicy,
  queue: Arc<QueueStore>,
  kv: Arc<KvStore>,
  registry: Arc<DeferredSyncRegistry>,
  orchestrator: SyncOrchestrator,
  lifecycle: LifecycleController,
  clients: Arc<ClientRegistry>,
  tasks: Arc<BackgroundTasks>,
}

impl ServiceWorker {
  /// Open the on-disk stores under `data_dir`.
  pub fn open(
    config: &Config,
    data_dir: &Path,
    fetcher: DynFetcher,
    replayer: Arc<dyn Replayer>,
  ) -> Result<Self, StorageError> {
    let storage = SqliteStorage::open(&data_dir.join("caches.db"))?;
    let sync_db = data_dir.join("sync.db");
    let queue = QueueStore::open(&sync_db);
    let kv = match KvStore::open(&sync_db) {
      Ok(kv) => kv,
      Err(e) => {
        warn!(
          "Settings store at {} unavailable, keeping settings in memory: {}",
          sync_db.display(),
          e
        );
        KvStore::open_in_memory()?
      }
    };
    Ok(Self::assemble(
      config,
      Arc::new(storage),
      kv,
      queue,
      fetcher,
      replayer,
    ))
  }

  /// Everything in memory; nothing survives the process.
  pub fn in_memory(
    config: &Config,
    fetcher: DynFetcher,
    replayer: Arc<dyn Replayer>,
  ) -> Result<Self, StorageError> {
    Ok(Self::assemble(
      config,
      Arc::new(SqliteStorage::open_in_memory()?),
      KvStore::open_in_memory()?,
      QueueStore::open_in_memory(),
      fetcher,
      replayer,
    ))
  }

  fn assemble(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    kv: KvStore,
    queue: QueueStore,
    fetcher: DynFetcher,
    replayer: Arc<dyn Replayer>,
  ) -> Self {
    let kv = Arc::new(kv);
    let queue = Arc::new(queue);
    let clients = Arc::new(ClientRegistry::new());
    let tasks = Arc::new(BackgroundTasks::new());

    let tiers = Arc::new(CacheTierManager::new(
      storage,
      Arc::clone(&fetcher),
      config.generation(),
      config.origin.clone(),
      config.cache.allow_list.clone(),
    ));
    let policy = FetchPolicy::new(
      Arc::clone(&tiers),
      fetcher,
      config.cache.content_guard,
      config.cache.shell.clone(),
      Arc::clone(&tasks),
    );
    let registry = Arc::new(DeferredSyncRegistry::new(
      config.sync.background_sync,
      Arc::clone(&kv),
    ));
    let orchestrator = SyncOrchestrator::new(
      Arc::clone(&queue),
      clients.clone(),
      replayer,
      Arc::clone(&kv),
      config.sync.tag.clone(),
    );
    let lifecycle = LifecycleController::new(
      Arc::clone(&tiers),
      Arc::clone(&clients),
      Arc::clone(&kv),
      config.cache.precache.clone(),
    );

    Self {
      tiers,
      policy,
      queue,
      kv,
      registry,
      orchestrator,
      lifecycle,
      clients,
      tasks,
    }
  }

  pub fn tiers(&self) -> &CacheTierManager {
    &self.tiers
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  pub fn kv(&self) -> &KvStore {
    &self.kv
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn registry(&self) -> &DeferredSyncRegistry {
    &self.registry
  }

  pub fn sync_state(&self) -> SyncState {
    self.orchestrator.state()
  }

  /// Wait for fire-and-forget work (runtime cache writes) to finish.
  pub async fn settle(&self) {
    self.tasks.settle().await;
  }

  pub async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome, LifecycleError> {
    match event {
      WorkerEvent::Install => Ok(EventOutcome::Installed(self.on_install().await)),
      WorkerEvent::Activate => self.on_activate().await.map(EventOutcome::Activated),
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.on_fetch(&request).await)),
      WorkerEvent::Sync { tag } => Ok(EventOutcome::Synced(self.on_sync(tag).await)),
      WorkerEvent::Message { source, data } => {
        Ok(EventOutcome::Message(self.on_message(source, &data).await))
      }
    }
  }

  async fn on_install(&self) -> InstallReport {
    self.lifecycle.install().await
  }

  async fn on_activate(&self) -> Result<ActivateReport, LifecycleError> {
    self.lifecycle.activate().await
  }

  async fn on_fetch(&self, request: &Request) -> Interception {
    if !self.lifecycle.state().can_intercept_fetch() {
      return Interception::Passthrough;
    }
    self.policy.resolve(request).await
  }

  async fn on_sync(&self, tag: String) -> SyncOutcome {
    self.orchestrator.trigger(SyncTrigger::Deferred { tag }).await
  }

  async fn on_message(&self, source: InstanceId, data: &Value) -> MessageOutcome {
    let Some(message) = InboundMessage::parse(data) else {
      debug!("Ignoring unrecognized message from {}", source);
      return MessageOutcome::Ignored;
    };

    match message {
      InboundMessage::QueueSync { action, data } => match self.queue.enqueue(&action, data) {
        Ok(item) => {
          let registered = match self.registry.register(self.orchestrator.tag()) {
            Ok(()) => true,
            Err(e) => {
              warn!("Deferred sync registration failed: {}", e);
              false
            }
          };
          MessageOutcome::Queued {
            id: item.id,
            registered,
          }
        }
        Err(e) => {
          warn!("Failed to queue action {} from {}: {}", action, source, e);
          MessageOutcome::QueueFailed {
            error: e.to_string(),
          }
        }
      },
      InboundMessage::SyncNow => {
        MessageOutcome::Synced(self.orchestrator.trigger(SyncTrigger::QueueUpdated).await)
      }
      InboundMessage::SkipWaiting => {
        self.lifecycle.skip_waiting();
        MessageOutcome::SkipWaiting
      }
    }
  }

  /// Fire every armed deferred sync, as the platform does once connectivity allows.
  pub async fn fire_pending_syncs(&self) -> Vec<SyncOutcome> {
    let mut outcomes = Vec::new();
    for tag in self.registry.take_pending() {
      info!("Firing deferred sync {}", tag);
      outcomes.push(self.on_sync(tag).await);
    }
    outcomes
  }

  /// One connectivity tick: probe, then fire armed syncs whenever the network
  /// is reachable, not only on the edge where it came back.
  pub async fn poll_connectivity(&self, monitor: &ConnectivityMonitor) -> Vec<SyncOutcome> {
    let restored = monitor.check().await;
    if monitor.state() != ConnectivityState::Online {
      return Vec::new();
    }
    if !restored && self.registry.pending().is_empty() {
      return Vec::new();
    }
    self.fire_pending_syncs().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::OutboundMessage;
  use crate::policy::ResponseSource;
  use crate::sync::SimulatedReplayer;
  use crate::testutil::{html, javascript, test_config, url, StubFetcher};
  use reqwest::header::ACCEPT;
  use reqwest::StatusCode;
  use serde_json::json;
  use std::time::Duration;

  async fn activated_worker(fetcher: Arc<StubFetcher>) -> ServiceWorker {
    let worker =
      ServiceWorker::in_memory(&test_config(), fetcher, Arc::new(SimulatedReplayer)).unwrap();
    worker.handle(WorkerEvent::Install).await.unwrap();
    worker.handle(WorkerEvent::Activate).await.unwrap();
    worker
  }

  fn respond(outcome: EventOutcome) -> crate::policy::Resolved {
    match outcome {
      EventOutcome::Fetch(Interception::Respond(resolved)) => resolved,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_queue_then_connectivity_sync_scenario() {
    let worker = activated_worker(StubFetcher::new()).await;
    let (id, mut rx) = worker.clients().connect().await;

    let outcome = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "QUEUE_SYNC", "action": "create-animal", "data": {"name": "Bessie"}}),
      })
      .await
      .unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::Queued {
        registered: true,
        ..
      })
    ));
    assert_eq!(worker.queue().len().unwrap(), 1);
    assert_eq!(worker.registry().pending(), vec!["sync-data"]);

    let outcomes = worker.fire_pending_syncs().await;
    assert_eq!(outcomes, vec![SyncOutcome::Completed { count: 1 }]);
    assert_eq!(rx.recv().await, Some(OutboundMessage::SyncStart { count: 1 }));
    assert_eq!(
      rx.recv().await,
      Some(OutboundMessage::SyncComplete { count: 1 })
    );
    assert_eq!(worker.queue().len().unwrap(), 0);
    assert!(worker.registry().pending().is_empty());
  }

  #[tokio::test]
  async fn test_registration_failure_still_queues() {
    let mut config = test_config();
    config.sync.background_sync = false;
    let worker =
      ServiceWorker::in_memory(&config, StubFetcher::new(), Arc::new(SimulatedReplayer)).unwrap();
    let (id, _rx) = worker.clients().connect().await;

    let outcome = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "QUEUE_SYNC", "action": "log-harvest", "data": {"kg": 40}}),
      })
      .await
      .unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::Queued {
        registered: false,
        ..
      })
    ));
    assert_eq!(worker.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_now_and_unknown_messages() {
    let worker = activated_worker(StubFetcher::new()).await;
    let (id, _rx) = worker.clients().connect().await;

    let ignored = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "PING"}),
      })
      .await
      .unwrap();
    assert!(matches!(
      ignored,
      EventOutcome::Message(MessageOutcome::Ignored)
    ));

    let synced = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "SYNC_NOW"}),
      })
      .await
      .unwrap();
    assert!(matches!(
      synced,
      EventOutcome::Message(MessageOutcome::Synced(SyncOutcome::Empty))
    ));
  }

  #[tokio::test]
  async fn test_misrouted_html_for_script_scenario() {
    let fetcher = StubFetcher::new();
    let worker = activated_worker(fetcher.clone()).await;
    let request = Request::get(url("/app.js")).with_header(ACCEPT, "*/*");
    fetcher.reply(&request.url, html("<!doctype html><title>Farm</title>"));

    let resolved = respond(worker.handle(WorkerEvent::Fetch(request.clone())).await.unwrap());
    worker.settle().await;

    assert_eq!(resolved.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(worker.tiers().lookup(&request).is_none());
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_precached_index() {
    let fetcher = StubFetcher::new();
    fetcher.reply(&url("/index.html"), html("<html>farm shell</html>"));
    let worker = activated_worker(fetcher.clone()).await;
    fetcher.go_offline();

    let resolved = respond(
      worker
        .handle(WorkerEvent::Fetch(Request::navigate(url("/animals/42"))))
        .await
        .unwrap(),
    );
    assert_eq!(resolved.source, ResponseSource::Shell);
    assert_eq!(resolved.response.body, b"<html>farm shell</html>");
  }

  #[tokio::test]
  async fn test_runtime_caching_then_offline_hit() {
    let fetcher = StubFetcher::new();
    let worker = activated_worker(fetcher.clone()).await;
    let request = Request::get(url("/assets/app.js"));
    fetcher.reply(&request.url, javascript("boot()"));

    respond(worker.handle(WorkerEvent::Fetch(request.clone())).await.unwrap());
    worker.settle().await;
    fetcher.go_offline();

    let resolved = respond(worker.handle(WorkerEvent::Fetch(request)).await.unwrap());
    assert_eq!(resolved.source, ResponseSource::Cache);
    assert_eq!(resolved.response.body, b"boot()");
  }

  #[tokio::test]
  async fn test_fetch_passes_through_before_activation() {
    let fetcher = StubFetcher::new();
    let worker =
      ServiceWorker::in_memory(&test_config(), fetcher.clone(), Arc::new(SimulatedReplayer))
        .unwrap();

    let outcome = worker
      .handle(WorkerEvent::Fetch(Request::get(url("/app.js"))))
      .await
      .unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Fetch(Interception::Passthrough)
    ));
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_unopenable_sync_store_degrades_queue_only() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sync.db")).unwrap();
    let fetcher = StubFetcher::new();
    fetcher.reply(&url("/index.html"), html("<html>farm shell</html>"));

    let worker = ServiceWorker::open(
      &test_config(),
      dir.path(),
      fetcher.clone(),
      Arc::new(SimulatedReplayer),
    )
    .unwrap();
    assert!(!worker.queue().is_available());

    match worker.handle(WorkerEvent::Install).await.unwrap() {
      EventOutcome::Installed(report) => assert_eq!(report.precache.cached, vec!["/index.html"]),
      other => panic!("expected install report, got {:?}", other),
    }
    worker.handle(WorkerEvent::Activate).await.unwrap();

    let (id, _rx) = worker.clients().connect().await;
    let queued = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "QUEUE_SYNC", "action": "create-animal", "data": {}}),
      })
      .await
      .unwrap();
    assert!(matches!(
      queued,
      EventOutcome::Message(MessageOutcome::QueueFailed { .. })
    ));

    let synced = worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "SYNC_NOW"}),
      })
      .await
      .unwrap();
    assert!(matches!(
      synced,
      EventOutcome::Message(MessageOutcome::Synced(SyncOutcome::Empty))
    ));

    let resolved = respond(
      worker
        .handle(WorkerEvent::Fetch(Request::navigate(url("/animals"))))
        .await
        .unwrap(),
    );
    assert_eq!(resolved.source, ResponseSource::Shell);
  }

  #[tokio::test]
  async fn test_armed_sync_fires_on_next_online_tick() {
    let fetcher = StubFetcher::new();
    let worker = activated_worker(fetcher.clone()).await;
    fetcher.reply(&url("/"), html("<html>up</html>"));
    let monitor = ConnectivityMonitor::new(fetcher.clone(), url("/"), Duration::from_secs(1));

    // Already online before anything is queued
    assert!(worker.poll_connectivity(&monitor).await.is_empty());

    let (id, mut rx) = worker.clients().connect().await;
    worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "QUEUE_SYNC", "action": "log-harvest", "data": {"kg": 40}}),
      })
      .await
      .unwrap();

    let outcomes = worker.poll_connectivity(&monitor).await;
    assert_eq!(outcomes, vec![SyncOutcome::Completed { count: 1 }]);
    assert_eq!(rx.recv().await, Some(OutboundMessage::SyncStart { count: 1 }));
    assert_eq!(
      rx.recv().await,
      Some(OutboundMessage::SyncComplete { count: 1 })
    );
    assert_eq!(worker.queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_armed_sync_waits_while_offline() {
    let fetcher = StubFetcher::new();
    let worker = activated_worker(fetcher.clone()).await;
    let monitor = ConnectivityMonitor::new(fetcher.clone(), url("/"), Duration::from_secs(1));
    let (id, _rx) = worker.clients().connect().await;
    worker
      .handle(WorkerEvent::Message {
        source: id,
        data: json!({"type": "QUEUE_SYNC", "action": "log-harvest", "data": {}}),
      })
      .await
      .unwrap();

    assert!(worker.poll_connectivity(&monitor).await.is_empty());
    assert_eq!(worker.queue().len().unwrap(), 1);
    assert_eq!(worker.registry().pending(), vec!["sync-data"]);

    fetcher.reply(&url("/"), html("<html>up</html>"));
    assert_eq!(
      worker.poll_connectivity(&monitor).await,
      vec![SyncOutcome::Completed { count: 1 }]
    );
  }
}
