//! Live network access behind a trait so the policy can be driven by a stub.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CACHE_CONTROL, PRAGMA};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;
use crate::http::{Request, Response};

/// How the fetch interacts with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  /// Bypass every HTTP cache on the way (used for pre-caching)
  NoStore,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request, mode: CacheMode) -> Result<Response, FetchError>;
}

pub type DynFetcher = Arc<dyn Fetcher>;

/// reqwest-backed fetcher. There is no per-request timeout unless one is configured.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| FetchError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request, mode: CacheMode) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    let mut headers = request.headers.clone();
    if mode == CacheMode::NoStore {
      headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
      headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    debug!("Fetching {} {}", request.method, url);

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(headers)
      .send()
      .await
      .map_err(|e| to_fetch_error(&url, e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
      .bytes()
      .await
      .map_err(|e| to_fetch_error(&url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn to_fetch_error(url: &str, e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout {
      url: url.to_string(),
    }
  } else {
    FetchError::Network {
      url: url.to_string(),
      message: e.to_string(),
    }
  }
}
