use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::http::Destination;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the controlled application (scheme + host + port)
  #[serde(default = "default_origin")]
  pub origin: Url,
  /// Where the cache and queue databases live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      connectivity: ConnectivityConfig::default(),
    }
  }
}

/// How the fetch policy treats HTML bodies returned for non-HTML requests.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentGuard {
  /// HTML served for an asset request is treated as a failure (503)
  #[default]
  Strict,
  /// Whatever the network returns is passed through and cached
  Lenient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub version: String,
  pub static_prefix: String,
  pub runtime_prefix: String,
  /// Fixed list of paths fetched and stored at install time
  pub precache: Vec<String>,
  /// App shell served to offline navigations
  pub shell: String,
  pub content_guard: ContentGuard,
  pub allow_list: AllowList,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v2".to_string(),
      static_prefix: "static".to_string(),
      runtime_prefix: "runtime".to_string(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
      ],
      shell: "/index.html".to_string(),
      content_guard: ContentGuard::Strict,
      allow_list: AllowList::default(),
    }
  }
}

/// Cross-origin requests that may still be cached.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllowList {
  pub destinations: Vec<Destination>,
  pub path_markers: Vec<String>,
  /// Matched case-insensitively against the request host
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub hosts: Vec<String>,
}

impl Default for AllowList {
  fn default() -> Self {
    Self {
      destinations: vec![
        Destination::Font,
        Destination::Image,
        Destination::Script,
        Destination::Style,
      ],
      path_markers: vec!["/assets/".to_string()],
      hosts: vec![
        "fonts.googleapis.com".to_string(),
        "fonts.gstatic.com".to_string(),
      ],
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag the deferred sync trigger is registered under
  pub tag: String,
  /// Whether deferred sync registration is available at all
  pub background_sync: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-data".to_string(),
      background_sync: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Probe target, defaults to the origin
  pub probe_url: Option<Url>,
  pub interval_secs: u64,
  pub timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      interval_secs: 15,
      timeout_secs: 5,
    }
  }
}

fn default_origin() -> Url {
  Url::parse("http://localhost:5173/").expect("static origin literal is valid")
}

/// Version-tagged names of the two cache tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  pub static_name: String,
  pub runtime_name: String,
}

impl CacheGeneration {
  pub fn names(&self) -> [&str; 2] {
    [&self.static_name, &self.runtime_name]
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agri-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agri-offline/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("agri-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agri-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Directory holding `caches.db`, `sync.db` and the log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("agri-offline"))
  }

  pub fn generation(&self) -> CacheGeneration {
    CacheGeneration {
      static_name: format!("{}-{}", self.cache.static_prefix, self.cache.version),
      runtime_name: format!("{}-{}", self.cache.runtime_prefix, self.cache.version),
    }
  }

  pub fn probe_url(&self) -> Url {
    self
      .connectivity
      .probe_url
      .clone()
      .unwrap_or_else(|| self.origin.clone())
  }
}
