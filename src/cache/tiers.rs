//! Cache tier manager: named, versioned caches and what may go into them.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AllowList, CacheGeneration};
use crate::error::StorageError;
use crate::http::{Request, Response};
use crate::network::{CacheMode, DynFetcher};

use super::storage::CacheStorage;

/// Handle to one named cache.
#[derive(Clone)]
pub struct Cache {
  name: String,
  storage: Arc<dyn CacheStorage>,
}

impl Cache {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Raw store, no eligibility checks beyond the GET-only rule.
  pub fn put(&self, request: &Request, response: &Response) -> Result<(), StorageError> {
    if !request.is_get() {
      return Err(StorageError::NotCacheable(request.method.to_string()));
    }
    self.storage.put(&self.name, &request.key(), response)
  }

  pub fn len(&self) -> Result<usize, StorageError> {
    self.storage.entry_count(&self.name)
  }
}

/// Outcome of a pre-cache batch.
#[derive(Debug, Default, Clone)]
pub struct PrecacheReport {
  pub cached: Vec<String>,
  pub failed: Vec<(String, String)>,
}

pub struct CacheTierManager {
  storage: Arc<dyn CacheStorage>,
  fetcher: DynFetcher,
  generation: CacheGeneration,
  origin: Url,
  allow_list: AllowList,
}

impl CacheTierManager {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: DynFetcher,
    generation: CacheGeneration,
    origin: Url,
    allow_list: AllowList,
  ) -> Self {
    Self {
      storage,
      fetcher,
      generation,
      origin,
      allow_list,
    }
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Return the named cache, creating it if absent.
  pub fn open(&self, name: &str) -> Result<Cache, StorageError> {
    self.storage.open_cache(name)?;
    Ok(Cache {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  pub fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    self.storage.cache_names()
  }

  /// Fetch every path with `no-store` and keep the successful ones.
  ///
  /// Individual failures are logged and reported, never propagated.
  pub async fn precache(&self, cache: &Cache, paths: &[String]) -> PrecacheReport {
    let attempts = paths.iter().map(|path| async move {
      let outcome = self.precache_one(cache, path).await;
      (path.clone(), outcome)
    });

    let mut report = PrecacheReport::default();
    for (path, outcome) in join_all(attempts).await {
      match outcome {
        Ok(()) => report.cached.push(path),
        Err(reason) => {
          warn!("Pre-cache of {} into {} failed: {}", path, cache.name(), reason);
          report.failed.push((path, reason));
        }
      }
    }

    info!(
      "Pre-cached {}/{} assets into {}",
      report.cached.len(),
      paths.len(),
      cache.name()
    );
    report
  }

  async fn precache_one(&self, cache: &Cache, path: &str) -> Result<(), String> {
    let url = self.origin.join(path).map_err(|e| e.to_string())?;
    let request = Request::get(url);

    let response = self
      .fetcher
      .fetch(&request, CacheMode::NoStore)
      .await
      .map_err(|e| e.to_string())?;

    if !response.is_ok() {
      return Err(format!("status {}", response.status));
    }

    cache.put(&request, &response).map_err(|e| e.to_string())
  }

  /// Whether `response` may be stored for `request`.
  pub fn is_cacheable(&self, request: &Request, response: &Response) -> bool {
    request.is_get()
      && response.is_ok()
      && (request.is_same_origin(&self.origin) || self.is_allow_listed(request))
  }

  fn is_allow_listed(&self, request: &Request) -> bool {
    let host_allowed = request
      .url
      .host_str()
      .map(|host| {
        let host = host.to_ascii_lowercase();
        self.allow_list.hosts.iter().any(|h| *h == host)
      })
      .unwrap_or(false);

    host_allowed
      || self.allow_list.destinations.contains(&request.destination)
      || self
        .allow_list
        .path_markers
        .iter()
        .any(|marker| request.url.path().contains(marker.as_str()))
  }

  /// Best-effort store. Returns whether the entry was written.
  pub fn put(&self, cache_name: &str, request: &Request, response: &Response) -> bool {
    if !self.is_cacheable(request, response) {
      debug!("Not caching {} (status {})", request.key(), response.status);
      return false;
    }

    let stored = self
      .open(cache_name)
      .and_then(|cache| cache.put(request, response));

    match stored {
      Ok(()) => {
        debug!("Cached {} in {}", request.key(), cache_name);
        true
      }
      Err(e) => {
        warn!("Failed to cache {} in {}: {}", request.key(), cache_name, e);
        false
      }
    }
  }

  /// Exact method + URL lookup in the current static tier, then the runtime tier.
  pub fn lookup(&self, request: &Request) -> Option<Response> {
    if !request.is_get() {
      return None;
    }

    let key = request.key();
    for name in self.generation.names() {
      match self.storage.get(name, &key) {
        Ok(Some(cached)) => {
          debug!("{} found in {} (cached {})", key, name, cached.cached_at);
          return Some(cached.response);
        }
        Ok(None) => {}
        Err(e) => warn!("Cache lookup of {} in {} failed: {}", key, name, e),
      }
    }
    None
  }

  /// Delete every cache whose name is not in `keep`. Returns the purged names.
  pub fn purge_except(&self, keep: &[&str]) -> Vec<String> {
    let names = match self.storage.cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!("Failed to enumerate caches for purge: {}", e);
        return Vec::new();
      }
    };

    let mut purged = Vec::new();
    for name in names {
      if keep.contains(&name.as_str()) {
        continue;
      }
      match self.storage.delete_cache(&name) {
        Ok(_) => {
          info!("Purged stale cache {}", name);
          purged.push(name);
        }
        Err(e) => warn!("Failed to purge cache {}: {}", name, e),
      }
    }
    purged
  }
}
