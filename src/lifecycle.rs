//! Install → activate → claim sequencing and cache-generation cutover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::cache::{CacheTierManager, PrecacheReport};
use crate::clients::ClientRegistry;
use crate::error::LifecycleError;
use crate::kv::KvStore;

pub const INSTALLED_GENERATION_KEY: &str = "worker.installed_generation";
pub const ACTIVE_GENERATION_KEY: &str = "worker.active_generation";

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, nothing run yet
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  /// Controlling instances and intercepting fetches
  Activated,
}

impl WorkerState {
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
  pub cache: String,
  pub precache: PrecacheReport,
}

#[derive(Debug, Clone)]
pub struct ActivateReport {
  pub purged: Vec<String>,
  pub claimed: usize,
}

pub struct LifecycleController {
  tiers: Arc<CacheTierManager>,
  clients: Arc<ClientRegistry>,
  kv: Arc<KvStore>,
  precache: Vec<String>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl LifecycleController {
  /// Resume from whatever generation was last installed or activated.
  pub fn new(
    tiers: Arc<CacheTierManager>,
    clients: Arc<ClientRegistry>,
    kv: Arc<KvStore>,
    precache: Vec<String>,
  ) -> Self {
    let current = tiers.generation().static_name.clone();
    let recorded = |key: &str| {
      kv.get::<String>(key)
        .unwrap_or_else(|e| {
          warn!("Failed to read {}: {}", key, e);
          None
        })
        .map(|name| name == current)
        .unwrap_or(false)
    };

    let state = if recorded(ACTIVE_GENERATION_KEY) {
      WorkerState::Activated
    } else if recorded(INSTALLED_GENERATION_KEY) {
      WorkerState::Installed
    } else {
      WorkerState::Parsed
    };

    Self {
      tiers,
      clients,
      kv,
      precache,
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Parsed)
  }

  fn set_state(&self, next: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      info!("Worker {} -> {}", *state, next);
      *state = next;
    }
  }

  /// Activate as soon as installed, without waiting for instances to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub async fn ready_to_activate(&self) -> bool {
    self.state() == WorkerState::Installed
      && (self.skip_waiting.load(Ordering::SeqCst) || self.clients.controlled_count().await == 0)
  }

  /// Open the static tier and pre-cache the fixed asset list.
  ///
  /// Never fails: unreachable assets and storage errors are only reported.
  pub async fn install(&self) -> InstallReport {
    self.set_state(WorkerState::Installing);
    let name = self.tiers.generation().static_name.clone();

    let precache = match self.tiers.open(&name) {
      Ok(cache) => self.tiers.precache(&cache, &self.precache).await,
      Err(e) => {
        warn!("Could not open static cache {}: {}", name, e);
        PrecacheReport {
          cached: Vec::new(),
          failed: self
            .precache
            .iter()
            .map(|path| (path.clone(), e.to_string()))
            .collect(),
        }
      }
    };

    if let Err(e) = self.kv.set(INSTALLED_GENERATION_KEY, &name) {
      warn!("Failed to record installed generation: {}", e);
    }
    // A fresh install waits for its own activation, even for the same generation
    if let Err(e) = self.kv.remove(ACTIVE_GENERATION_KEY) {
      warn!("Failed to clear active generation: {}", e);
    }
    self.set_state(WorkerState::Installed);
    self.skip_waiting();

    InstallReport {
      cache: name,
      precache,
    }
  }

  /// Purge superseded generations and take control of every open instance.
  pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
    let current = self.state();
    if current != WorkerState::Installed {
      return Err(LifecycleError::InvalidState {
        expected: WorkerState::Installed,
        actual: current,
      });
    }

    self.set_state(WorkerState::Activating);
    let generation = self.tiers.generation().clone();
    let purged = self.tiers.purge_except(&generation.names());
    let claimed = self.clients.claim().await;

    if let Err(e) = self.kv.set(ACTIVE_GENERATION_KEY, &generation.static_name) {
      warn!("Failed to record active generation: {}", e);
    }
    self.set_state(WorkerState::Activated);

    Ok(ActivateReport { purged, claimed })
  }
}
