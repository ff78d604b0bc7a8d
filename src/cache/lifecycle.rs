//! Versioned cache generations: provision on install, swap on activate.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{CacheStorage, NamespaceInfo, StoredResponse};
use crate::config::ProvisionPolicy;
use crate::error::{ActivationError, DurableStoreError, ProvisionError};
use crate::http::{resolve, Request, RequestKey, Response};
use crate::network::Network;

/// Outcome of provisioning one cache version.
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
  pub namespace: String,
  /// URLs stored in the namespace
  pub stored: Vec<String>,
  /// URLs that could not be cached, with the reason
  pub failed: Vec<(String, String)>,
}

impl ProvisionReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Result of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub active: String,
  /// Superseded namespaces removed by this call
  pub removed: Vec<String>,
}

/// Owns the notion of "the active cache generation".
///
/// The active marker lives in storage, so every read and write consults the
/// durable state rather than a field that could be stale after a restart.
pub struct CacheLifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  origin: Url,
  vary_headers: Vec<String>,
}

impl<S: CacheStorage> CacheLifecycleManager<S> {
  pub fn new(storage: S, network: Arc<dyn Network>, origin: Url) -> Self {
    Self {
      storage: Arc::new(storage),
      network,
      origin,
      vary_headers: Vec::new(),
    }
  }

  /// Request headers that take part in cache keys.
  pub fn with_vary_headers(mut self, vary_headers: Vec<String>) -> Self {
    self.vary_headers = vary_headers;
    self
  }

  pub fn key_for(&self, request: &Request) -> Option<RequestKey> {
    RequestKey::for_request(request, &self.vary_headers)
  }

  /// Create namespace `name` and fill it with every asset in `assets`.
  ///
  /// Assets are fetched concurrently and stored in manifest order. Under
  /// `BestEffort` failures are logged and reported; under `AllOrNothing` the
  /// first failure aborts and the half-built namespace is dropped. Only a
  /// namespace that got to the end is marked installed and can be activated.
  pub async fn provision_version(
    &self,
    name: &str,
    assets: &[String],
    policy: ProvisionPolicy,
  ) -> Result<ProvisionReport, ProvisionError> {
    info!(namespace = name, assets = assets.len(), "Provisioning cache version");
    self.storage.open_namespace(name)?;

    let fetches = assets.iter().map(|asset| self.fetch_asset(asset));
    let results = join_all(fetches).await;

    let mut report = ProvisionReport {
      namespace: name.to_string(),
      ..Default::default()
    };

    for (asset, result) in assets.iter().zip(results) {
      match result {
        Ok((key, response)) => {
          self.storage.put(name, &key, &response)?;
          debug!(namespace = name, url = %asset, "Cached asset");
          report.stored.push(asset.clone());
        }
        Err(reason) => {
          warn!(namespace = name, url = %asset, %reason, "Failed to cache asset during install");
          if policy == ProvisionPolicy::AllOrNothing {
            self.discard_unless_active(name)?;
            return Err(ProvisionError::AssetFailed {
              url: asset.clone(),
              reason,
            });
          }
          report.failed.push((asset.clone(), reason));
        }
      }
    }

    if !self.storage.mark_installed(name)? {
      return Err(DurableStoreError::NamespaceMissing(name.to_string()).into());
    }
    info!(
      namespace = name,
      stored = report.stored.len(),
      failed = report.failed.len(),
      "Provisioning finished"
    );
    Ok(report)
  }

  async fn fetch_asset(&self, asset: &str) -> Result<(RequestKey, Response), String> {
    let url = resolve(&self.origin, asset).map_err(|e| format!("invalid url: {}", e))?;
    let request = Request::get(url);
    let key = self.key_for(&request).ok_or("not a GET request")?;

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| e.reason)?;

    if !response.is_cacheable() {
      return Err(format!("status {}", response.status));
    }
    Ok((key, response))
  }

  fn discard_unless_active(&self, name: &str) -> Result<(), DurableStoreError> {
    if self.storage.active_namespace()?.as_deref() != Some(name) {
      self.storage.delete_namespace(name)?;
    }
    Ok(())
  }

  /// Make `name` the served generation and delete every other one.
  ///
  /// The active marker is committed before anything is deleted, so a
  /// namespace is only removed once it is no longer the one being read.
  /// Calling this again with the same name is a no-op. A version whose
  /// install failed or never ran is refused and the current one stays.
  pub fn activate(&self, name: &str) -> Result<ActivationReport, ActivationError> {
    if !self.storage.set_active(name)? {
      warn!(namespace = name, "Refusing to activate a version that is not installed");
      return Err(ActivationError::NotInstalled(name.to_string()));
    }

    let mut removed = Vec::new();
    for ns in self.storage.namespaces()? {
      if ns.name != name {
        info!(namespace = %ns.name, "Deleting old cache");
        self.storage.delete_namespace(&ns.name)?;
        removed.push(ns.name);
      }
    }

    info!(active = name, removed = removed.len(), "Cache version activated");
    Ok(ActivationReport {
      active: name.to_string(),
      removed,
    })
  }

  /// Read from the active namespace.
  pub fn read(&self, key: &RequestKey) -> Result<Option<StoredResponse>, DurableStoreError> {
    match self.storage.active_namespace()? {
      Some(ns) => self.storage.get(&ns, key),
      None => Ok(None),
    }
  }

  /// Write into the active namespace. Dropped when nothing is active yet.
  pub fn write(&self, key: &RequestKey, response: &Response) -> Result<(), DurableStoreError> {
    if self.storage.put_active(key, response)?.is_none() {
      debug!(url = key.url(), "No active cache, skipping write");
    }
    Ok(())
  }

  /// Find a key in any namespace, active first.
  pub fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>, DurableStoreError> {
    self.storage.find_any(key)
  }

  pub fn namespaces(&self) -> Result<Vec<NamespaceInfo>, DurableStoreError> {
    self.storage.namespaces()
  }

  pub fn active(&self) -> Result<Option<String>, DurableStoreError> {
    self.storage.active_namespace()
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::ScriptedNetwork;

  fn origin() -> Url {
    Url::parse("http://localhost:8000/").unwrap()
  }

  fn manager(network: Arc<ScriptedNetwork>) -> CacheLifecycleManager<SqliteStorage> {
    CacheLifecycleManager::new(SqliteStorage::open_in_memory().unwrap(), network, origin())
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::for_url(&origin().join(path).unwrap())
  }

  fn shell() -> Vec<String> {
    vec!["/shell.css".to_string(), "/shell.js".to_string()]
  }

  fn installed(manager: &CacheLifecycleManager<SqliteStorage>, name: &str) {
    manager.storage.open_namespace(name).unwrap();
    manager.storage.mark_installed(name).unwrap();
  }

  #[tokio::test]
  async fn test_provision_stores_every_asset() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.respond("/shell.js", 200, "init()");
    let manager = manager(network);

    let report = manager
      .provision_version("v1", &shell(), ProvisionPolicy::BestEffort)
      .await
      .unwrap();
    manager.activate("v1").unwrap();

    assert!(report.is_complete());
    assert_eq!(report.stored, shell());
    assert!(manager.read(&key("/shell.css")).unwrap().is_some());
    assert!(manager.read(&key("/shell.js")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_best_effort_keeps_reachable_assets() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.fail("/shell.js");
    let manager = manager(network);

    let report = manager
      .provision_version("v1", &shell(), ProvisionPolicy::BestEffort)
      .await
      .unwrap();
    manager.activate("v1").unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.stored, vec!["/shell.css".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/shell.js");
    assert!(manager.read(&key("/shell.css")).unwrap().is_some());
    assert!(manager.read(&key("/shell.js")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_all_or_nothing_drops_namespace() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.respond("/shell.js", 404, "missing");
    let manager = manager(network);

    let err = manager
      .provision_version("v1", &shell(), ProvisionPolicy::AllOrNothing)
      .await
      .unwrap_err();

    assert!(matches!(err, ProvisionError::AssetFailed { ref url, .. } if url == "/shell.js"));
    assert!(manager.namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_install_cannot_replace_active_generation() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.respond("/shell.js", 200, "init()");
    let manager = manager(network.clone());
    manager
      .provision_version("v1", &shell(), ProvisionPolicy::AllOrNothing)
      .await
      .unwrap();
    manager.activate("v1").unwrap();

    network.fail("/shell.js");
    assert!(manager
      .provision_version("v2", &shell(), ProvisionPolicy::AllOrNothing)
      .await
      .is_err());
    let err = manager.activate("v2").unwrap_err();

    assert!(matches!(err, ActivationError::NotInstalled(ref n) if n == "v2"));
    let namespaces = manager.namespaces().unwrap();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].name, "v1");
    assert!(namespaces[0].active);
    assert!(manager.read(&key("/shell.js")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_reinstall_of_active_version_keeps_it() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.respond("/shell.js", 200, "init()");
    let manager = manager(network.clone());
    manager
      .provision_version("v1", &shell(), ProvisionPolicy::BestEffort)
      .await
      .unwrap();
    manager.activate("v1").unwrap();

    network.fail("/shell.css");
    assert!(manager
      .provision_version("v1", &shell(), ProvisionPolicy::AllOrNothing)
      .await
      .is_err());
    assert_eq!(manager.active().unwrap().as_deref(), Some("v1"));
    assert!(manager.read(&key("/shell.css")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_precache_readable_with_vary_headers() {
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("/shell.css", 200, "body{}");
    network.respond("/shell.js", 200, "init()");
    let manager = manager(network).with_vary_headers(vec!["Accept-Language".to_string()]);

    manager
      .provision_version("v1", &shell(), ProvisionPolicy::BestEffort)
      .await
      .unwrap();
    manager.activate("v1").unwrap();

    let request = Request::get(origin().join("/shell.js").unwrap());
    let key = manager.key_for(&request).unwrap();
    assert!(manager.read(&key).unwrap().is_some());
  }

  #[test]
  fn test_activate_refuses_uninstalled_version() {
    let manager = manager(Arc::new(ScriptedNetwork::new()));
    manager.storage.open_namespace("half-built").unwrap();

    assert!(manager.activate("half-built").is_err());
    assert!(manager.activate("never-seen").is_err());
    assert_eq!(manager.active().unwrap(), None);
  }

  #[test]
  fn test_activate_is_idempotent() {
    let manager = manager(Arc::new(ScriptedNetwork::new()));
    installed(&manager, "v1");
    installed(&manager, "v2");

    let first = manager.activate("v2").unwrap();
    let second = manager.activate("v2").unwrap();

    assert_eq!(first.removed, vec!["v1".to_string()]);
    assert!(second.removed.is_empty());
    let names: Vec<_> = manager.namespaces().unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["v2".to_string()]);
  }

  #[test]
  fn test_only_activated_namespace_survives() {
    let manager = manager(Arc::new(ScriptedNetwork::new()));
    for ns in ["b2b-offline-cache-v1", "v1", "firat-b2b-cache-v2"] {
      installed(&manager, ns);
    }
    manager.activate("v1").unwrap();
    installed(&manager, "v2");
    manager.activate("v2").unwrap();

    let namespaces = manager.namespaces().unwrap();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].name, "v2");
    assert!(namespaces[0].active);
  }

  #[test]
  fn test_write_goes_to_active_namespace() {
    let manager = manager(Arc::new(ScriptedNetwork::new()));
    let response = Response::new("http://localhost:8000/api/products", 200, b"[]".to_vec());

    manager.write(&key("/api/products"), &response).unwrap();
    assert!(manager.read(&key("/api/products")).unwrap().is_none());

    installed(&manager, "v1");
    manager.activate("v1").unwrap();
    manager.write(&key("/api/products"), &response).unwrap();
    assert_eq!(
      manager.read(&key("/api/products")).unwrap().unwrap().response.body,
      b"[]"
    );
  }
}
