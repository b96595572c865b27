//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse};
use crate::config::Config;
use crate::error::{FetchError, ReplayError, StorageError};
use crate::http::{Request, RequestKey, Response};
use crate::network::{CacheMode, Fetcher};
use crate::queue::QueuedAction;
use crate::sync::Replayer;

pub const ORIGIN: &str = "http://localhost:5173/";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn test_config() -> Config {
  Config {
    origin: Url::parse(ORIGIN).unwrap(),
    ..Config::default()
  }
}

pub fn html(body: &str) -> Response {
  Response::new(StatusCode::OK, body).with_content_type("text/html; charset=utf-8")
}

pub fn javascript(body: &str) -> Response {
  Response::new(StatusCode::OK, body).with_content_type("text/javascript")
}

/// Fetcher answering from a per-URL script; unknown URLs fail like an offline network.
#[derive(Default)]
pub struct StubFetcher {
  replies: Mutex<HashMap<String, Result<Response, FetchError>>>,
  calls: AtomicUsize,
  modes: Mutex<Vec<CacheMode>>,
}

impl StubFetcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reply(&self, url: &Url, response: Response) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.to_string(), Ok(response));
  }

  pub fn fail(&self, url: &Url) {
    self.replies.lock().unwrap().insert(
      url.to_string(),
      Err(FetchError::Network {
        url: url.to_string(),
        message: "connection refused".to_string(),
      }),
    );
  }

  /// Drop every scripted reply, simulating loss of connectivity.
  pub fn go_offline(&self) {
    self.replies.lock().unwrap().clear();
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn modes(&self) -> Vec<CacheMode> {
    self.modes.lock().unwrap().clone()
  }
}

#[async_trait]
impl Fetcher for StubFetcher {
  async fn fetch(&self, request: &Request, mode: CacheMode) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.modes.lock().unwrap().push(mode);
    let url = request.url.to_string();
    self
      .replies
      .lock()
      .unwrap()
      .get(&url)
      .cloned()
      .unwrap_or(Err(FetchError::Network {
        url,
        message: "offline".to_string(),
      }))
  }
}

/// Replayer that rejects every item.
pub struct FailingReplayer;

#[async_trait]
impl Replayer for FailingReplayer {
  async fn replay(&self, item: &QueuedAction) -> Result<(), ReplayError> {
    Err(ReplayError::Rejected {
      id: item.id,
      action: item.action.clone(),
      message: "backend unreachable".to_string(),
    })
  }
}

/// Cache backend that opens caches but cannot write entries.
pub struct FullDiskStorage;

impl CacheStorage for FullDiskStorage {
  fn open_cache(&self, _name: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _name: &str) -> Result<bool, StorageError> {
    Ok(false)
  }

  fn put(&self, _name: &str, _key: &RequestKey, _response: &Response) -> Result<(), StorageError> {
    Err(StorageError::Io(std::io::Error::new(
      std::io::ErrorKind::Other,
      "disk full",
    )))
  }

  fn get(&self, _name: &str, _key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
    Ok(None)
  }

  fn entry_count(&self, _name: &str) -> Result<usize, StorageError> {
    Ok(0)
  }
}
