//! Fire-and-forget work that must still be allowed to finish.
//!
//! Handlers spawn side work here (for example runtime cache writes) and return
//! immediately; `settle` waits for everything spawned so far.

use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Default)]
pub struct BackgroundTasks {
  set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.set.lock() {
      Ok(mut set) => {
        // Reap whatever already finished so the set does not grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        warn!("Background task set poisoned, running task detached");
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every task spawned before this call.
  pub async fn settle(&self) {
    let mut pending = match self.set.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!("Background task failed: {}", e);
      }
    }
  }
}
