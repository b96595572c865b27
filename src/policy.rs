//! Per-request choice between cache and network.
//!
//! Cache-first for anything already captured, network otherwise, with a
//! content-type guard that refuses HTML bodies for asset requests. When the
//! network cannot answer, navigations fall back to the cached app shell and
//! everything else gets an empty 503.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::CacheTierManager;
use crate::config::ContentGuard;
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::network::{CacheMode, DynFetcher};
use crate::tasks::BackgroundTasks;

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Cache,
  Network,
  /// Cached app shell served for an offline navigation
  Shell,
  /// Generated 503
  Synthetic,
}

#[derive(Debug, Clone)]
pub struct Resolved {
  pub response: Response,
  pub source: ResponseSource,
}

#[derive(Debug)]
pub enum Interception {
  /// Not handled; the request goes to the network untouched.
  Passthrough,
  Respond(Resolved),
  /// Navigation with neither network nor a cached shell.
  Failed(FetchError),
}

impl Interception {
  fn respond(response: Response, source: ResponseSource) -> Self {
    Interception::Respond(Resolved { response, source })
  }
}

/// Why the network path was abandoned.
enum Fallback {
  Network(FetchError),
  /// HTML body for a request that did not ask for HTML
  Misrouted,
}

pub struct FetchPolicy {
  tiers: Arc<CacheTierManager>,
  fetcher: DynFetcher,
  guard: ContentGuard,
  shell: String,
  tasks: Arc<BackgroundTasks>,
}

impl FetchPolicy {
  pub fn new(
    tiers: Arc<CacheTierManager>,
    fetcher: DynFetcher,
    guard: ContentGuard,
    shell: impl Into<String>,
    tasks: Arc<BackgroundTasks>,
  ) -> Self {
    Self {
      tiers,
      fetcher,
      guard,
      shell: shell.into(),
      tasks,
    }
  }

  pub async fn resolve(&self, request: &Request) -> Interception {
    if !request.is_get() {
      return Interception::Passthrough;
    }

    if let Some(cached) = self.tiers.lookup(request) {
      debug!("Cache hit for {}", request.key());
      return Interception::respond(cached, ResponseSource::Cache);
    }

    let fallback = match self.fetcher.fetch(request, CacheMode::Default).await {
      Ok(response) if self.is_misrouted(request, &response) => {
        warn!(
          "HTML returned for non-HTML request {}, refusing to serve or cache it",
          request.key()
        );
        Fallback::Misrouted
      }
      Ok(response) => {
        if request.is_same_origin(self.tiers.origin()) {
          self.cache_in_background(request, &response);
        }
        return Interception::respond(response, ResponseSource::Network);
      }
      Err(e) => {
        debug!("Network failed for {}: {}", request.key(), e);
        Fallback::Network(e)
      }
    };

    self.fall_back(request, fallback)
  }

  fn is_misrouted(&self, request: &Request, response: &Response) -> bool {
    match self.guard {
      ContentGuard::Strict => response.is_html() && !request.wants_html(),
      ContentGuard::Lenient => false,
    }
  }

  fn cache_in_background(&self, request: &Request, response: &Response) {
    let tiers = Arc::clone(&self.tiers);
    let request = request.clone();
    let response = response.clone();
    self.tasks.spawn(async move {
      let runtime = tiers.generation().runtime_name.clone();
      tiers.put(&runtime, &request, &response);
    });
  }

  fn fall_back(&self, request: &Request, fallback: Fallback) -> Interception {
    // The entry may have been written while the network attempt was in flight
    if let Some(cached) = self.tiers.lookup(request) {
      return Interception::respond(cached, ResponseSource::Cache);
    }

    if request.wants_html() {
      if let Some(shell) = self.shell_response() {
        return Interception::respond(shell, ResponseSource::Shell);
      }
      if let Fallback::Network(e) = fallback {
        return Interception::Failed(e);
      }
    }

    Interception::respond(Response::service_unavailable(), ResponseSource::Synthetic)
  }

  fn shell_response(&self) -> Option<Response> {
    let url = self.tiers.origin().join(&self.shell).ok()?;
    self.tiers.lookup(&Request::get(url))
  }
}
