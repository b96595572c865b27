//! Open application instances and broadcast delivery to them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::messages::OutboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl std::fmt::Display for InstanceId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "instance-{}", self.0)
  }
}

/// Delivery seam used by the sync orchestrator.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn list_instances(&self) -> Vec<InstanceId>;

  async fn notify(&self, instance: InstanceId, message: &OutboundMessage)
    -> Result<(), NotifyError>;

  /// Deliver to every listed instance; failures are logged per instance.
  async fn broadcast(&self, message: &OutboundMessage) -> usize {
    let mut delivered = 0;
    for instance in self.list_instances().await {
      match self.notify(instance, message).await {
        Ok(()) => delivered += 1,
        Err(e) => warn!("Failed to notify {}: {}", instance, e),
      }
    }
    delivered
  }
}

struct Instance {
  tx: mpsc::UnboundedSender<OutboundMessage>,
  controlled: bool,
}

/// Registry of connected instances, each fed through its own channel.
#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  instances: RwLock<BTreeMap<InstanceId, Instance>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new instance. It starts uncontrolled until the next `claim`.
  pub async fn connect(&self) -> (InstanceId, mpsc::UnboundedReceiver<OutboundMessage>) {
    let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let (tx, rx) = mpsc::unbounded_channel();
    self.instances.write().await.insert(
      id,
      Instance {
        tx,
        controlled: false,
      },
    );
    debug!("{} connected", id);
    (id, rx)
  }

  pub async fn disconnect(&self, id: InstanceId) {
    if self.instances.write().await.remove(&id).is_some() {
      debug!("{} disconnected", id);
    }
  }

  /// Take control of every connected instance. Returns how many were newly claimed.
  pub async fn claim(&self) -> usize {
    let mut instances = self.instances.write().await;
    let mut claimed = 0;
    for instance in instances.values_mut() {
      if !instance.controlled {
        instance.controlled = true;
        claimed += 1;
      }
    }
    claimed
  }

  pub async fn controlled_count(&self) -> usize {
    self
      .instances
      .read()
      .await
      .values()
      .filter(|i| i.controlled)
      .count()
  }
}

#[async_trait]
impl Notifier for ClientRegistry {
  async fn list_instances(&self) -> Vec<InstanceId> {
    self.instances.read().await.keys().copied().collect()
  }

  async fn notify(
    &self,
    instance: InstanceId,
    message: &OutboundMessage,
  ) -> Result<(), NotifyError> {
    let sent = {
      let instances = self.instances.read().await;
      match instances.get(&instance) {
        Some(entry) => entry.tx.send(message.clone()).is_ok(),
        None => return Err(NotifyError::Disconnected(instance)),
      }
    };

    if !sent {
      // Receiver dropped: the tab is gone
      self.disconnect(instance).await;
      return Err(NotifyError::Disconnected(instance));
    }
    Ok(())
  }
}
