//! Deferred replay of queued offline actions.
//!
//! A drain reads a snapshot of the queue, replays every item in order through
//! the `Replayer`, and only then removes the replayed items. Any failure
//! leaves the queue untouched, so the next trigger retries the same batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clients::Notifier;
use crate::error::{RegistrationError, ReplayError};
use crate::kv::KvStore;
use crate::messages::OutboundMessage;
use crate::queue::{QueueStore, QueuedAction};

pub const LAST_SUCCESS_KEY: &str = "sync.last_success";
pub const LAST_ERROR_KEY: &str = "sync.last_error";
const PENDING_TAGS_KEY: &str = "sync.pending_tags";

/// Sends one queued action to wherever it must end up.
#[async_trait]
pub trait Replayer: Send + Sync {
  async fn replay(&self, item: &QueuedAction) -> Result<(), ReplayError>;
}

/// Stand-in for a backend: every action is accepted as-is.
pub struct SimulatedReplayer;

#[async_trait]
impl Replayer for SimulatedReplayer {
  async fn replay(&self, item: &QueuedAction) -> Result<(), ReplayError> {
    debug!("Simulated replay of action {} ({})", item.id, item.action);
    Ok(())
  }
}

/// Platform hook for arming a deferred sync.
pub trait SyncRegistrar: Send + Sync {
  fn register(&self, tag: &str) -> Result<(), RegistrationError>;
}

/// Deferred sync registrations, persisted so they survive a restart.
pub struct DeferredSyncRegistry {
  supported: bool,
  kv: Arc<KvStore>,
  lock: Mutex<()>,
}

impl DeferredSyncRegistry {
  pub fn new(supported: bool, kv: Arc<KvStore>) -> Self {
    Self {
      supported,
      kv,
      lock: Mutex::new(()),
    }
  }

  fn load(&self) -> BTreeSet<String> {
    match self.kv.get::<BTreeSet<String>>(PENDING_TAGS_KEY) {
      Ok(tags) => tags.unwrap_or_default(),
      Err(e) => {
        warn!("Failed to read pending sync tags: {}", e);
        BTreeSet::new()
      }
    }
  }

  pub fn pending(&self) -> Vec<String> {
    self.load().into_iter().collect()
  }

  /// Remove and return every armed tag.
  pub fn take_pending(&self) -> Vec<String> {
    let _guard = self.lock.lock();
    let tags = self.load();
    if !tags.is_empty() {
      if let Err(e) = self.kv.remove(PENDING_TAGS_KEY) {
        warn!("Failed to clear pending sync tags: {}", e);
      }
    }
    tags.into_iter().collect()
  }
}

impl SyncRegistrar for DeferredSyncRegistry {
  fn register(&self, tag: &str) -> Result<(), RegistrationError> {
    if !self.supported {
      return Err(RegistrationError::Unsupported);
    }

    let _guard = self.lock.lock();
    let mut tags = self.load();
    if tags.insert(tag.to_string()) {
      self
        .kv
        .set(PENDING_TAGS_KEY, &tags)
        .map_err(|_| RegistrationError::Closed)?;
    }
    debug!("Deferred sync armed for tag {}", tag);
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
  Completed { count: usize },
  Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Platform-fired deferred sync
  Deferred { tag: String },
  /// An instance asked to try right away
  QueueUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  UnknownTag(String),
  /// Another drain is running and will cover the queue
  AlreadyDraining,
  Empty,
  Completed { count: usize },
  Failed { error: String },
}

impl std::fmt::Display for SyncOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SyncOutcome::UnknownTag(tag) => write!(f, "unknown sync tag {}", tag),
      SyncOutcome::AlreadyDraining => write!(f, "a sync is already running"),
      SyncOutcome::Empty => write!(f, "queue empty, nothing to sync"),
      SyncOutcome::Completed { count } => write!(f, "synced {} actions", count),
      SyncOutcome::Failed { error } => write!(f, "sync failed: {}", error),
    }
  }
}

/// Persisted summary of the last drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
  pub count: usize,
  pub at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

pub struct SyncOrchestrator {
  queue: Arc<QueueStore>,
  notifier: Arc<dyn Notifier>,
  replayer: Arc<dyn Replayer>,
  kv: Arc<KvStore>,
  tag: String,
  state: Mutex<SyncState>,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<QueueStore>,
    notifier: Arc<dyn Notifier>,
    replayer: Arc<dyn Replayer>,
    kv: Arc<KvStore>,
    tag: impl Into<String>,
  ) -> Self {
    Self {
      queue,
      notifier,
      replayer,
      kv,
      tag: tag.into(),
      state: Mutex::new(SyncState::Idle),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn state(&self) -> SyncState {
    self
      .state
      .lock()
      .map(|s| s.clone())
      .unwrap_or(SyncState::Idle)
  }

  fn set_state(&self, next: SyncState) {
    if let Ok(mut state) = self.state.lock() {
      debug!("Sync state {:?} -> {:?}", *state, next);
      *state = next;
    }
  }

  /// Move to `Draining` unless a drain is already running.
  fn try_begin(&self) -> bool {
    match self.state.lock() {
      Ok(mut state) if *state != SyncState::Draining => {
        *state = SyncState::Draining;
        true
      }
      _ => false,
    }
  }

  pub async fn trigger(&self, trigger: SyncTrigger) -> SyncOutcome {
    if let SyncTrigger::Deferred { tag } = &trigger {
      if *tag != self.tag {
        debug!("Ignoring sync for unrecognized tag {}", tag);
        return SyncOutcome::UnknownTag(tag.clone());
      }
    }

    if !self.try_begin() {
      debug!("Sync trigger {:?} skipped, drain already running", trigger);
      return SyncOutcome::AlreadyDraining;
    }

    let outcome = self.drain().await;
    self.set_state(SyncState::Idle);
    outcome
  }

  async fn drain(&self) -> SyncOutcome {
    let items = match self.queue.drain_all() {
      Ok(items) => items,
      Err(e) => {
        warn!("Treating sync queue as empty: {}", e);
        Vec::new()
      }
    };

    if items.is_empty() {
      return SyncOutcome::Empty;
    }

    let count = items.len();
    info!("Draining {} queued actions", count);
    self
      .notifier
      .broadcast(&OutboundMessage::SyncStart { count })
      .await;

    match self.replay_all(&items).await {
      Ok(()) => {
        self.record_success(count);
        self.set_state(SyncState::Completed { count });
        self
          .notifier
          .broadcast(&OutboundMessage::SyncComplete { count })
          .await;
        info!("Sync complete, {} actions replayed", count);
        SyncOutcome::Completed { count }
      }
      Err(error) => {
        warn!("Sync failed, queue retained: {}", error);
        self.record_failure(count, &error);
        self.set_state(SyncState::Failed {
          error: error.clone(),
        });
        self
          .notifier
          .broadcast(&OutboundMessage::SyncError {
            error: error.clone(),
          })
          .await;
        SyncOutcome::Failed { error }
      }
    }
  }

  async fn replay_all(&self, items: &[QueuedAction]) -> Result<(), String> {
    for item in items {
      self
        .replayer
        .replay(item)
        .await
        .map_err(|e| e.to_string())?;
    }

    if let Some(last) = items.last() {
      self
        .queue
        .clear_through(last.id)
        .map_err(|e| format!("Failed to clear replayed actions: {}", e))?;
    }
    Ok(())
  }

  fn record_success(&self, count: usize) {
    let record = SyncRecord {
      count,
      at: Utc::now(),
      error: None,
    };
    if let Err(e) = self.kv.merge_lww(LAST_SUCCESS_KEY, &record, record.at) {
      warn!("Failed to record sync success: {}", e);
    }
  }

  fn record_failure(&self, count: usize, error: &str) {
    let record = SyncRecord {
      count,
      at: Utc::now(),
      error: Some(error.to_string()),
    };
    if let Err(e) = self.kv.merge_lww(LAST_ERROR_KEY, &record, record.at) {
      warn!("Failed to record sync failure: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clients::ClientRegistry;
  use crate::testutil::FailingReplayer;
  use serde_json::json;
  use tokio::sync::Notify;

  struct Harness {
    queue: Arc<QueueStore>,
    clients: Arc<ClientRegistry>,
    kv: Arc<KvStore>,
    orchestrator: Arc<SyncOrchestrator>,
  }

  fn harness(replayer: Arc<dyn Replayer>) -> Harness {
    let queue = Arc::new(QueueStore::open_in_memory());
    let clients = Arc::new(ClientRegistry::new());
    let kv = Arc::new(KvStore::open_in_memory().unwrap());
    let orchestrator = Arc::new(SyncOrchestrator::new(
      Arc::clone(&queue),
      clients.clone(),
      replayer,
      Arc::clone(&kv),
      "sync-data",
    ));
    Harness {
      queue,
      clients,
      kv,
      orchestrator,
    }
  }

  fn deferred(tag: &str) -> SyncTrigger {
    SyncTrigger::Deferred {
      tag: tag.to_string(),
    }
  }

  #[tokio::test]
  async fn test_drain_notifies_and_clears() {
    let h = harness(Arc::new(SimulatedReplayer));
    let (_id, mut rx) = h.clients.connect().await;
    h.queue
      .enqueue("create-animal", json!({"name": "Bessie"}))
      .unwrap();
    assert_eq!(h.queue.len().unwrap(), 1);

    let outcome = h.orchestrator.trigger(deferred("sync-data")).await;

    assert_eq!(outcome, SyncOutcome::Completed { count: 1 });
    assert_eq!(rx.recv().await, Some(OutboundMessage::SyncStart { count: 1 }));
    assert_eq!(
      rx.recv().await,
      Some(OutboundMessage::SyncComplete { count: 1 })
    );
    assert_eq!(h.queue.len().unwrap(), 0);
    assert_eq!(h.orchestrator.state(), SyncState::Idle);

    let record: SyncRecord = h.kv.get(LAST_SUCCESS_KEY).unwrap().unwrap();
    assert_eq!(record.count, 1);
  }

  #[tokio::test]
  async fn test_empty_queue_sends_nothing() {
    let h = harness(Arc::new(SimulatedReplayer));
    let (_id, mut rx) = h.clients.connect().await;

    assert_eq!(
      h.orchestrator.trigger(SyncTrigger::QueueUpdated).await,
      SyncOutcome::Empty
    );
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_failure_keeps_queue_and_reports_error() {
    let h = harness(Arc::new(FailingReplayer));
    let (_id, mut rx) = h.clients.connect().await;
    h.queue.enqueue("create-animal", json!({})).unwrap();
    h.queue.enqueue("update-crop", json!({})).unwrap();

    let outcome = h.orchestrator.trigger(deferred("sync-data")).await;

    assert!(matches!(outcome, SyncOutcome::Failed { .. }));
    assert_eq!(rx.recv().await, Some(OutboundMessage::SyncStart { count: 2 }));
    assert!(matches!(
      rx.recv().await,
      Some(OutboundMessage::SyncError { .. })
    ));
    assert_eq!(h.queue.len().unwrap(), 2);
    assert!(h.kv.get::<SyncRecord>(LAST_ERROR_KEY).unwrap().is_some());
    assert!(h.kv.get::<SyncRecord>(LAST_SUCCESS_KEY).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let h = harness(Arc::new(SimulatedReplayer));
    h.queue.enqueue("create-animal", json!({})).unwrap();

    assert_eq!(
      h.orchestrator.trigger(deferred("other")).await,
      SyncOutcome::UnknownTag("other".to_string())
    );
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unavailable_queue_is_treated_as_empty() {
    let clients = Arc::new(ClientRegistry::new());
    let orchestrator = SyncOrchestrator::new(
      Arc::new(QueueStore::unavailable()),
      clients,
      Arc::new(SimulatedReplayer),
      Arc::new(KvStore::open_in_memory().unwrap()),
      "sync-data",
    );
    assert_eq!(
      orchestrator.trigger(SyncTrigger::QueueUpdated).await,
      SyncOutcome::Empty
    );
  }

  /// Records replay order and blocks until released.
  struct GatedReplayer {
    seen: Mutex<Vec<String>>,
    entered: Notify,
    release: Notify,
  }

  #[async_trait]
  impl Replayer for GatedReplayer {
    async fn replay(&self, item: &QueuedAction) -> Result<(), ReplayError> {
      self.seen.lock().unwrap().push(item.action.clone());
      self.entered.notify_one();
      self.release.notified().await;
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_fifo_order_and_items_queued_mid_drain_survive() {
    let replayer = Arc::new(GatedReplayer {
      seen: Mutex::new(Vec::new()),
      entered: Notify::new(),
      release: Notify::new(),
    });
    let h = harness(replayer.clone());
    for kind in ["a", "b", "c"] {
      h.queue.enqueue(kind, json!({})).unwrap();
    }

    let orchestrator = Arc::clone(&h.orchestrator);
    let drain = tokio::spawn(async move { orchestrator.trigger(SyncTrigger::QueueUpdated).await });

    replayer.entered.notified().await;
    assert_eq!(h.orchestrator.state(), SyncState::Draining);
    assert_eq!(
      h.orchestrator.trigger(SyncTrigger::QueueUpdated).await,
      SyncOutcome::AlreadyDraining
    );
    h.queue.enqueue("d", json!({})).unwrap();

    for _ in 0..3 {
      replayer.release.notify_one();
      tokio::task::yield_now().await;
    }

    assert_eq!(drain.await.unwrap(), SyncOutcome::Completed { count: 3 });
    assert_eq!(*replayer.seen.lock().unwrap(), vec!["a", "b", "c"]);

    let left = h.queue.drain_all().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].action, "d");
  }

  #[test]
  fn test_registry_persists_and_takes_tags() {
    let kv = Arc::new(KvStore::open_in_memory().unwrap());
    let registry = DeferredSyncRegistry::new(true, Arc::clone(&kv));
    registry.register("sync-data").unwrap();
    registry.register("sync-data").unwrap();

    let reopened = DeferredSyncRegistry::new(true, kv);
    assert_eq!(reopened.pending(), vec!["sync-data"]);
    assert_eq!(reopened.take_pending(), vec!["sync-data"]);
    assert!(reopened.take_pending().is_empty());
  }

  #[test]
  fn test_unsupported_registration_fails() {
    let kv = Arc::new(KvStore::open_in_memory().unwrap());
    let registry = DeferredSyncRegistry::new(false, kv);
    assert!(matches!(
      registry.register("sync-data"),
      Err(RegistrationError::Unsupported)
    ));
  }
}
