use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub sequence: SequenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Application origin, e.g. "https://fleet.example.com"
  pub origin: Url,
  /// Path prefix of the mutation/listing API, relative to the origin
  #[serde(default = "default_api_base")]
  pub api_base: String,
  /// Per-request timeout in milliseconds
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Generation identifier; bump it whenever `precache` changes
  #[serde(default = "default_generation")]
  pub generation: String,
  /// Navigable routes stored at install time
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Path prefixes that always go to the network (build assets, dynamic API)
  #[serde(default = "default_never_cache")]
  pub never_cache: Vec<String>,
  /// Document served to navigations when the network and cache both miss
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// Hosts that switch the router into development bypass
  #[serde(default = "default_development_hosts")]
  pub development_hosts: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: default_generation(),
      precache: default_precache(),
      never_cache: default_never_cache(),
      offline_fallback: default_offline_fallback(),
      development_hosts: default_development_hosts(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Attempts per item before it is marked failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  /// How long an IN_FLIGHT claim holds before another replayer may take
  /// the item back. Must exceed the longest single request.
  #[serde(default = "default_claim_lease_ms")]
  pub claim_lease_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      initial_backoff_ms: default_initial_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      claim_lease_ms: default_claim_lease_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// Address used to ask the OS routing table whether a route exists.
  /// No packets are sent to it.
  #[serde(default = "default_probe_addr")]
  pub probe_addr: SocketAddr,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_addr: default_probe_addr(),
      poll_interval_ms: default_poll_interval_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
  /// Re-allocations after a uniqueness conflict before giving up
  #[serde(default = "default_allocation_retries")]
  pub max_retries: u32,
}

impl Default for SequenceConfig {
  fn default() -> Self {
    Self {
      max_retries: default_allocation_retries(),
    }
  }
}

fn default_api_base() -> String {
  "/api/".to_string()
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

fn default_generation() -> String {
  "v1".to_string()
}

fn default_precache() -> Vec<String> {
  [
    "/",
    "/offline",
    "/work-orders",
    "/maintenance",
    "/fuel-loads",
    "/vehicles",
    "/reports",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_never_cache() -> Vec<String> {
  vec!["/_next/".to_string(), "/api/".to_string()]
}

fn default_offline_fallback() -> String {
  "/offline".to_string()
}

fn default_development_hosts() -> Vec<String> {
  vec![
    "localhost".to_string(),
    "127.0.0.1".to_string(),
    "[::1]".to_string(),
  ]
}

fn default_max_attempts() -> u32 {
  5
}

fn default_initial_backoff_ms() -> u64 {
  500
}

fn default_max_backoff_ms() -> u64 {
  30_000
}

fn default_claim_lease_ms() -> u64 {
  120_000
}

fn default_probe_addr() -> SocketAddr {
  SocketAddr::from(([1, 1, 1, 1], 53))
}

fn default_poll_interval_ms() -> u64 {
  2_000
}

fn default_allocation_retries() -> u32 {
  3
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetdesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetdesk/config.yaml
  ///
  /// `FLEETDESK_ORIGIN` overrides `server.origin` afterwards.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/fleetdesk/config.yaml\n\
                 with at least `server: {{ origin: https://... }}`."
        ))
      }
    };

    if let Ok(origin) = std::env::var("FLEETDESK_ORIGIN") {
      config.server.origin = Url::parse(&origin)
        .map_err(|e| eyre!("Invalid FLEETDESK_ORIGIN '{}': {}", origin, e))?;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fleetdesk.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetdesk").join("config.yaml");
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

  fn validate(&self) -> Result<()> {
    match self.server.origin.scheme() {
      "http" | "https" => {}
      other => return Err(eyre!("server.origin must be http(s), got '{}'", other)),
    }
    if self.queue.max_attempts == 0 {
      return Err(eyre!("queue.max_attempts must be at least 1"));
    }
    if self.queue.claim_lease_ms <= self.server.request_timeout_ms {
      return Err(eyre!(
        "queue.claim_lease_ms ({}) must exceed server.request_timeout_ms ({})",
        self.queue.claim_lease_ms,
        self.server.request_timeout_ms
      ));
    }
    if self.cache.generation.trim().is_empty() {
      return Err(eyre!("cache.generation must not be empty"));
    }
    Ok(())
  }

  /// Base URL mutations are replayed against, always ending in '/'.
  pub fn api_url(&self) -> Result<Url> {
    let base = if self.server.api_base.ends_with('/') {
      self.server.api_base.clone()
    } else {
      format!("{}/", self.server.api_base)
    };
    self
      .server
      .origin
      .join(&base)
      .map_err(|e| eyre!("Invalid server.api_base '{}': {}", self.server.api_base, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.server.request_timeout_ms)
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Checks FLEETDESK_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FLEETDESK_API_TOKEN").ok()
  }
}

/// Per-user data directory ($XDG_DATA_HOME/fleetdesk).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("fleetdesk"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::from_yaml("server:\n  origin: https://fleet.example.com\n").unwrap();
    assert_eq!(config.server.api_base, "/api/");
    assert_eq!(config.cache.generation, "v1");
    assert_eq!(config.cache.offline_fallback, "/offline");
    assert!(config.cache.never_cache.contains(&"/api/".to_string()));
    assert_eq!(config.queue.max_attempts, 5);
    assert_eq!(config.queue.claim_lease_ms, 120_000);
    assert_eq!(config.sequence.max_retries, 3);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
server:
  origin: https://fleet.example.com
  request_timeout_ms: 2500
cache:
  generation: v7
  precache: ["/", "/offline"]
queue:
  max_attempts: 2
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.request_timeout(), Duration::from_millis(2500));
    assert_eq!(config.cache.generation, "v7");
    assert_eq!(config.cache.precache.len(), 2);
    assert_eq!(config.queue.max_attempts, 2);
    assert_eq!(config.queue.initial_backoff_ms, 500);
  }

  #[test]
  fn test_api_url() {
    let mut config = Config::from_yaml("server:\n  origin: https://fleet.example.com/app/\n").unwrap();
    assert_eq!(config.api_url().unwrap().as_str(), "https://fleet.example.com/api/");

    config.server.api_base = "v2".to_string();
    assert_eq!(
      config.api_url().unwrap().as_str(),
      "https://fleet.example.com/app/v2/"
    );
  }

  #[test]
  fn test_rejects_claim_lease_shorter_than_request() {
    let yaml = r#"
server:
  origin: https://fleet.example.com
  request_timeout_ms: 10000
queue:
  claim_lease_ms: 5000
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_non_http_origin() {
    let config = Config::from_yaml("server:\n  origin: ftp://fleet.example.com\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let result = Config::load(Some(Path::new("/nonexistent/fleetdesk.yaml")));
    assert!(result.is_err());
  }
}
