use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::routes::{self, RouteRule};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Portal origin, e.g. "http://localhost:8000"
  pub origin: String,
  /// Cache generation name; bump it to roll out a new shell
  pub cache_version: String,
  /// URLs prefetched at install (own-origin paths or absolute third-party URLs)
  pub precache: Vec<String>,
  pub provision_policy: ProvisionPolicy,
  /// Document served to navigations that fail with nothing cached
  pub offline_page: String,
  /// Order-creation endpoint whose failed POSTs go to the outbox
  pub orders_path: String,
  /// Request headers that take part in cache keys
  pub vary_headers: Vec<String>,
  /// Replaces the built-in route table when set
  pub routes: Option<Vec<RouteRule>>,
  pub network: NetworkConfig,
  pub outbox: OutboxConfig,
  pub sync: SyncConfig,
  /// Where cache.db, outbox.db and logs live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
}

/// What install does when a precache asset cannot be fetched.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionPolicy {
  /// Store everything reachable, log the rest
  #[default]
  BestEffort,
  /// Any failure aborts install and drops the new namespace
  AllOrNothing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  /// Rejected submissions before a record is dead-lettered
  pub max_attempts: u32,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self { max_attempts: 5 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tags that run the order drain
  pub order_tags: Vec<String>,
  /// Tag emitted by the connectivity monitor when the network comes back
  pub restoration_tag: String,
  pub probe_path: String,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      order_tags: vec![
        "sync-new-orders".into(),
        "sync-new-order".into(),
        "manual-sync-trigger".into(),
      ],
      restoration_tag: "sync-new-orders".into(),
      probe_path: "/".into(),
      probe_interval_secs: 15,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000".into(),
      cache_version: "firat-b2b-cache-v3".into(),
      precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
      provision_policy: ProvisionPolicy::default(),
      offline_page: "/offline".into(),
      orders_path: "/api/orders".into(),
      vary_headers: Vec::new(),
      routes: None,
      network: NetworkConfig::default(),
      outbox: OutboxConfig::default(),
      sync: SyncConfig::default(),
      data_dir: None,
    }
  }
}

/// The portal shell: pages, vendored assets, images and the offline page.
const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/products",
  "/cart",
  "/orders",
  "/customer-balances",
  "/login",
  "/offline",
  "/static/manifest.json",
  "/static/css/bootstrap.min.css",
  "/static/css/select2.min.css",
  "/static/css/dataTables.bootstrap5.min.css",
  "/static/css/bootstrap-icons.css",
  "/static/css/fonts/bootstrap-icons.woff2",
  "/static/js/jquery.min.js",
  "/static/js/bootstrap.bundle.min.js",
  "/static/js/select2.full.min.js",
  "/static/js/jquery.dataTables.min.js",
  "/static/json_data/tr.json",
  "/static/images/Logo.png",
  "/static/images/urun_yok.png",
  "/static/images/icon-192.png",
  "/static/images/icon-512.png",
  "https://cdnjs.cloudflare.com/ajax/libs/lightgallery/2.7.1/css/lightgallery.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/lightgallery/2.7.1/lightgallery.min.js",
];

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./portal-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/portal-offline/config.yaml
  ///
  /// With no file anywhere the built-in portal defaults are used.
  /// Environment overrides are applied last.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("portal-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("portal-offline").join("config.yaml");
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
    config.origin_url()?;
    Ok(config)
  }

  /// Apply PORTAL_OFFLINE_ORIGIN and PORTAL_OFFLINE_DATA_DIR.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("PORTAL_OFFLINE_ORIGIN") {
      self.origin = origin;
      self.origin_url()?;
    }
    if let Ok(dir) = std::env::var("PORTAL_OFFLINE_DATA_DIR") {
      self.data_dir = Some(PathBuf::from(dir));
    }
    Ok(self)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Directory holding the databases and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("portal-offline"))
  }

  /// Configured route table, or the built-in one.
  pub fn route_rules(&self) -> Vec<RouteRule> {
    match &self.routes {
      Some(rules) => rules.clone(),
      None => routes::default_rules(&self.orders_path),
    }
  }
}
