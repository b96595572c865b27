//! Connectivity tracking: probes the origin and reports offline → online edges.

use reqwest::Method;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::Request;
use crate::network::{CacheMode, DynFetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online = 0,
  Offline = 1,
  /// Before the first probe
  Unknown = 2,
}

impl std::fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectivityState::Online => write!(f, "online"),
      ConnectivityState::Offline => write!(f, "offline"),
      ConnectivityState::Unknown => write!(f, "unknown"),
    }
  }
}

pub struct ConnectivityMonitor {
  fetcher: DynFetcher,
  probe_url: Url,
  interval: Duration,
  state: AtomicU8,
}

impl ConnectivityMonitor {
  pub fn new(fetcher: DynFetcher, probe_url: Url, interval: Duration) -> Self {
    Self {
      fetcher,
      probe_url,
      interval,
      state: AtomicU8::new(ConnectivityState::Unknown as u8),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn state(&self) -> ConnectivityState {
    match self.state.load(Ordering::SeqCst) {
      0 => ConnectivityState::Online,
      1 => ConnectivityState::Offline,
      _ => ConnectivityState::Unknown,
    }
  }

  /// Probe once. Returns true when the network just became reachable,
  /// including the first successful probe after startup.
  ///
  /// Any HTTP response counts as online; only a failed fetch is offline.
  pub async fn check(&self) -> bool {
    let request = Request::get(self.probe_url.clone()).with_method(Method::HEAD);
    let next = match self.fetcher.fetch(&request, CacheMode::NoStore).await {
      Ok(_) => ConnectivityState::Online,
      Err(e) => {
        debug!("Connectivity probe failed: {}", e);
        ConnectivityState::Offline
      }
    };

    let previous = self.state();
    self.state.store(next as u8, Ordering::SeqCst);

    match (previous, next) {
      (ConnectivityState::Offline | ConnectivityState::Unknown, ConnectivityState::Online) => {
        info!("Network reachable");
        true
      }
      (ConnectivityState::Online, ConnectivityState::Offline) => {
        warn!("Network connectivity lost");
        false
      }
      _ => false,
    }
  }
}
