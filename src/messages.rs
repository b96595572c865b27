//! Messages exchanged between the worker and application instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application instance → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
  /// Persist an offline action and ask for a deferred replay
  QueueSync {
    action: String,
    #[serde(default)]
    data: Value,
  },
  /// Try to drain the queue right now
  SyncNow,
  /// Activate a freshly installed version without waiting
  SkipWaiting,
}

/// Worker → every application instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
  SyncStart { count: usize },
  SyncComplete { count: usize },
  SyncError { error: String },
}

impl InboundMessage {
  /// Parse a raw message; anything unrecognized yields `None`.
  pub fn parse(raw: &Value) -> Option<Self> {
    serde_json::from_value(raw.clone()).ok()
  }
}
