//! Request/response model shared by the cache tiers, the fetch policy and the
//! network seam.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Request mode as the page issued it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Loading a new top-level document
  Navigate,
  /// Any subresource fetch
  #[default]
  Subresource,
}

/// What kind of resource the request is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
  #[default]
  Empty,
}

impl std::str::FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      "" | "empty" => Ok(Self::Empty),
      other => Err(format!("unknown request destination '{}'", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub headers: HeaderMap,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
      destination: Destination::default(),
      headers: HeaderMap::new(),
    }
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_mode(RequestMode::Navigate)
      .with_destination(Destination::Document)
      .with_header(ACCEPT, "text/html,application/xhtml+xml")
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Adds a header; values that are not valid header text are dropped.
  pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.insert(name, value);
    }
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Whether the `Accept` header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get(ACCEPT)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("text/html"))
      .unwrap_or(false)
  }

  /// Navigation, or any request that declared it wants HTML back.
  pub fn wants_html(&self) -> bool {
    self.is_navigation() || self.accepts_html()
  }

  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }

  /// Normalized identity used as the cache key: method plus URL without fragment.
  pub fn key(&self) -> RequestKey {
    let mut url = self.url.clone();
    url.set_fragment(None);
    RequestKey {
      method: self.method.as_str().to_string(),
      url: url.to_string(),
    }
  }
}

/// Exact method + URL identity of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_content_type(mut self, content_type: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(content_type) {
      self.headers.insert(CONTENT_TYPE, value);
    }
    self
  }

  /// Empty-bodied 503 returned when an asset cannot be resolved.
  pub fn service_unavailable() -> Self {
    Self::new(StatusCode::SERVICE_UNAVAILABLE, Vec::new())
  }

  /// 2xx, the only responses eligible for caching.
  pub fn is_ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }

  pub fn is_html(&self) -> bool {
    self
      .content_type()
      .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
      .unwrap_or(false)
  }

  /// Header pairs in a form that survives a round trip through storage.
  pub fn header_pairs(&self) -> Vec<(String, String)> {
    self
      .headers
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect()
  }

  /// Rebuild a stored response. `None` when `status` is not a valid HTTP status.
  pub fn from_parts(
    status: u16,
    header_pairs: &[(String, String)],
    body: Vec<u8>,
  ) -> Option<Self> {
    let status = StatusCode::from_u16(status).ok()?;
    let mut headers = HeaderMap::new();
    for (name, value) in header_pairs {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    Some(Self {
      status,
      headers,
      body,
    })
  }
}
