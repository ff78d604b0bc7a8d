//! Strategy executor: the read/write protocol behind each route.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cache::{CacheLifecycleManager, CacheStorage};
use crate::clients::{ClientMessage, ClientRegistry};
use crate::error::{ServerRejection, TransportError};
use crate::http::{
  resolve, Destination, Request, RequestKey, Response, ResponseSource, IDEMPOTENCY_KEY,
};
use crate::network::Network;
use crate::outbox::OutboxStore;
use crate::routes::{Route, StrategyId};

/// Served when a page cannot be loaded and `/offline` was never cached.
const BUILTIN_OFFLINE_PAGE: &str = "<!doctype html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page has not been saved for offline use. Reconnect and try again.</p>\
</body></html>";

pub struct StrategyExecutor<S: CacheStorage> {
  cache: Arc<CacheLifecycleManager<S>>,
  network: Arc<dyn Network>,
  outbox: Arc<OutboxStore>,
  clients: Arc<ClientRegistry>,
  offline_page: String,
}

impl<S: CacheStorage> StrategyExecutor<S> {
  pub fn new(
    cache: Arc<CacheLifecycleManager<S>>,
    network: Arc<dyn Network>,
    outbox: Arc<OutboxStore>,
    clients: Arc<ClientRegistry>,
    offline_page: &str,
  ) -> Self {
    Self {
      cache,
      network,
      outbox,
      clients,
      offline_page: offline_page.to_string(),
    }
  }

  /// Run the strategy chosen by the classifier.
  ///
  /// `Err` is returned only when no response of any kind can be produced:
  /// a cache-first miss with no fallback, or a passthrough request while
  /// offline.
  pub async fn execute(
    &self,
    request: &Request,
    route: Route<'_>,
  ) -> Result<Response, TransportError> {
    debug!(url = %request.url, strategy = ?route.strategy, "Dispatching request");

    match route.strategy {
      StrategyId::CacheFirst => self.cache_first(request, route.fallback).await,
      StrategyId::NetworkFirst => self.network_first(request).await,
      StrategyId::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      StrategyId::Passthrough => self.passthrough(request).await,
      StrategyId::OrderOutbox => self.order_outbox(request).await,
    }
  }

  /// Cache hit returns without touching the network.
  async fn cache_first(
    &self,
    request: &Request,
    fallback: Option<&str>,
  ) -> Result<Response, TransportError> {
    let Some(key) = self.cache.key_for(request) else {
      return self.passthrough(request).await;
    };

    if let Some(hit) = self.lookup(request, &key) {
      return Ok(hit);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.store(&key, &response);
        }
        Ok(response)
      }
      Err(e) => {
        if let Some(fallback) = fallback.and_then(|f| self.fallback(f)) {
          debug!(url = %request.url, "Serving registered fallback");
          return Ok(fallback);
        }
        Err(e)
      }
    }
  }

  /// Fresh from the network when possible, cache when not, offline
  /// response as the last resort.
  async fn network_first(&self, request: &Request) -> Result<Response, TransportError> {
    let Some(key) = self.cache.key_for(request) else {
      return self.passthrough(request).await;
    };

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.store(&key, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %request.url, reason = %e.reason, "Network failed, trying cache");
        Ok(
          self
            .lookup(request, &key)
            .unwrap_or_else(|| self.offline_response(request)),
        )
      }
    }
  }

  /// Network-priority revalidation: every successful response refreshes
  /// the entry, even when the cached copy was still fresh.
  async fn stale_while_revalidate(&self, request: &Request) -> Result<Response, TransportError> {
    self.network_first(request).await
  }

  async fn passthrough(&self, request: &Request) -> Result<Response, TransportError> {
    self.network.fetch(request).await
  }

  /// Order creation. Delivered responses go back untouched; a transport
  /// failure queues the order and answers 202 locally.
  ///
  /// The idempotency key is fixed before the first attempt and the queued
  /// record reuses it, so the server can drop a replay of an order it
  /// accepted just before the connection failed.
  async fn order_outbox(&self, request: &Request) -> Result<Response, TransportError> {
    let (request, idempotency_key) = match request.header(IDEMPOTENCY_KEY) {
      Some(key) => (request.clone(), key.to_string()),
      None => {
        let key = uuid::Uuid::new_v4().to_string();
        (request.clone().with_header(IDEMPOTENCY_KEY, &key), key)
      }
    };

    let err = match self.network.fetch(&request).await {
      Ok(response) => {
        if !response.is_success() {
          let rejection = ServerRejection {
            status: response.status,
            body: response.text(),
          };
          warn!(url = %request.url, %rejection, "Order rejected by server");
        }
        return Ok(response);
      }
      Err(e) => e,
    };

    let payload = match request
      .body
      .as_deref()
      .map(serde_json::from_slice::<serde_json::Value>)
    {
      Some(Ok(payload)) => payload,
      _ => {
        warn!(url = %request.url, "Order body is not JSON, not queueing");
        return Err(err);
      }
    };

    let url = request.url.to_string();
    match self.outbox.enqueue_with_key(&payload, &idempotency_key) {
      Ok(id) => {
        self.clients.broadcast(ClientMessage::OrderQueued { id });
        Ok(
          Response::json(url, 202, &json!({ "status": "pending_sync", "outbox_id": id }))
            .with_header("X-Offline-Queued", "1"),
        )
      }
      Err(e) => {
        error!(error = %e, "Could not save order offline");
        Ok(Response::json(
          url,
          503,
          &json!({
            "status": "offline_save_failed",
            "message": "The order could not be saved offline. Please retry when online.",
          }),
        ))
      }
    }
  }

  /// Exact variant first, then the header-less entry stored at install.
  fn lookup(&self, request: &Request, key: &RequestKey) -> Option<Response> {
    self.read(key).or_else(|| {
      let plain = RequestKey::for_request(request, &[])?;
      if plain == *key {
        return None;
      }
      self.read(&plain)
    })
  }

  fn read(&self, key: &RequestKey) -> Option<Response> {
    match self.cache.read(key) {
      Ok(hit) => hit.map(|stored| stored.response),
      Err(e) => {
        warn!(url = key.url(), error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  fn store(&self, key: &RequestKey, response: &Response) {
    if let Err(e) = self.cache.write(key, response) {
      warn!(url = key.url(), error = %e, "Cache write failed");
    }
  }

  /// Cached response for a route's fallback URL.
  fn fallback(&self, target: &str) -> Option<Response> {
    let url = resolve(self.cache.origin(), target).ok()?;
    self
      .read(&RequestKey::for_url(&url))
      .map(|r| r.with_source(ResponseSource::Fallback))
  }

  /// Offline page for documents, a JSON 503 for everything else.
  fn offline_response(&self, request: &Request) -> Response {
    let url = request.url.to_string();

    if request.is_navigation() || request.destination == Destination::Document {
      let cached = resolve(self.cache.origin(), &self.offline_page)
        .ok()
        .and_then(|u| self.cache.match_any(&RequestKey::for_url(&u)).ok().flatten());
      return match cached {
        Some(stored) => stored.response.with_source(ResponseSource::Fallback),
        None => Response::html(url, 503, BUILTIN_OFFLINE_PAGE),
      };
    }

    Response::json(url, 503, &json!({ "error": "offline", "cached": false }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::routes::{default_rules, RouteClassifier};
  use crate::testing::ScriptedNetwork;
  use url::Url;

  struct Fixture {
    network: Arc<ScriptedNetwork>,
    cache: Arc<CacheLifecycleManager<SqliteStorage>>,
    outbox: Arc<OutboxStore>,
    clients: Arc<ClientRegistry>,
    executor: StrategyExecutor<SqliteStorage>,
    classifier: RouteClassifier,
  }

  fn origin() -> Url {
    Url::parse("http://localhost:8000/").unwrap()
  }

  fn fixture() -> Fixture {
    fixture_with_vary(Vec::new())
  }

  fn fixture_with_vary(vary_headers: Vec<String>) -> Fixture {
    let network = Arc::new(ScriptedNetwork::new());
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_namespace("v1").unwrap();
    storage.mark_installed("v1").unwrap();
    let cache = Arc::new(
      CacheLifecycleManager::new(storage, network.clone(), origin()).with_vary_headers(vary_headers),
    );
    cache.activate("v1").unwrap();
    let outbox = Arc::new(OutboxStore::open_in_memory().unwrap());
    let clients = Arc::new(ClientRegistry::default());
    let executor = StrategyExecutor::new(
      cache.clone(),
      network.clone(),
      outbox.clone(),
      clients.clone(),
      "/offline",
    );
    Fixture {
      network,
      cache,
      outbox,
      clients,
      executor,
      classifier: RouteClassifier::new(default_rules("/api/orders"), origin()),
    }
  }

  impl Fixture {
    async fn run(&self, request: Request) -> Result<Response, TransportError> {
      let route = self.classifier.classify(&request);
      self.executor.execute(&request, route).await
    }

    fn seed(&self, path: &str, body: &str) {
      let url = origin().join(path).unwrap();
      self
        .cache
        .write(
          &RequestKey::for_url(&url),
          &Response::new(url.as_str(), 200, body.as_bytes().to_vec()),
        )
        .unwrap();
    }

    fn cached(&self, path: &str) -> Option<String> {
      let url = origin().join(path).unwrap();
      self
        .cache
        .read(&RequestKey::for_url(&url))
        .unwrap()
        .map(|s| s.response.text())
    }
  }

  fn get(path: &str) -> Request {
    Request::get(origin().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_never_contacts_network() {
    let f = fixture();
    f.seed("/static/js/jquery.min.js", "cached");
    f.network.respond("/static/js/jquery.min.js", 200, "fresh");

    let response = f.run(get("/static/js/jquery.min.js")).await.unwrap();
    assert_eq!(response.text(), "cached");
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let f = fixture();
    f.network.respond("/static/css/site.css", 200, "body{}");

    let response = f.run(get("/static/css/site.css")).await.unwrap();
    assert_eq!(response.text(), "body{}");
    assert_eq!(f.cached("/static/css/site.css").as_deref(), Some("body{}"));

    // second read is served from cache
    f.run(get("/static/css/site.css")).await.unwrap();
    assert_eq!(f.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let f = fixture();
    f.network.respond("/static/css/missing.css", 404, "nope");

    let response = f.run(get("/static/css/missing.css")).await.unwrap();
    assert_eq!(response.status, 404);
    assert!(f.cached("/static/css/missing.css").is_none());
  }

  #[tokio::test]
  async fn test_cache_first_offline_serves_placeholder_image() {
    let f = fixture();
    f.seed("/static/images/urun_yok.png", "placeholder");
    f.network.set_offline(true);

    let request = get("/static/images/products/42.jpg").with_destination(Destination::Image);
    let response = f.run(request).await.unwrap();
    assert_eq!(response.text(), "placeholder");
    assert_eq!(response.source, ResponseSource::Fallback);
  }

  #[tokio::test]
  async fn test_cache_first_offline_without_fallback_propagates() {
    let f = fixture();
    f.network.set_offline(true);
    assert!(f.run(get("/static/js/app.js")).await.is_err());
  }

  #[tokio::test]
  async fn test_network_first_overwrites_cache() {
    let f = fixture();
    let page = || Request::navigate(origin().join("/orders").unwrap());

    f.network.respond("/orders", 200, "old");
    f.run(page()).await.unwrap();
    assert_eq!(f.cached("/orders").as_deref(), Some("old"));

    f.network.respond("/orders", 200, "new");
    let response = f.run(page()).await.unwrap();
    assert_eq!(response.text(), "new");
    assert_eq!(f.cached("/orders").as_deref(), Some("new"));
  }

  #[tokio::test]
  async fn test_network_first_offline_serves_cached_page() {
    let f = fixture();
    f.seed("/cart", "cart page");
    f.network.set_offline(true);

    let response = f
      .run(Request::navigate(origin().join("/cart").unwrap()))
      .await
      .unwrap();
    assert_eq!(response.text(), "cart page");
    assert_eq!(response.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_navigation_miss_gets_offline_document() {
    let f = fixture();
    f.seed("/offline", "offline page");
    f.network.set_offline(true);

    let response = f
      .run(Request::navigate(origin().join("/customer-balances").unwrap()))
      .await
      .unwrap();
    assert_eq!(response.text(), "offline page");
    assert_eq!(response.source, ResponseSource::Fallback);
  }

  #[tokio::test]
  async fn test_navigation_miss_without_offline_page_synthesizes_one() {
    let f = fixture();
    f.network.set_offline(true);

    let response = f
      .run(Request::navigate(origin().join("/orders").unwrap()))
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthesized);
    assert!(response.text().contains("offline"));
  }

  #[tokio::test]
  async fn test_api_refresh_replaces_existing_entry() {
    let f = fixture();
    f.seed("/api/products", "[1]");
    f.network.respond("/api/products", 200, "[1,2]");

    let response = f.run(get("/api/products")).await.unwrap();
    assert_eq!(response.text(), "[1,2]");
    assert_eq!(f.cached("/api/products").as_deref(), Some("[1,2]"));
  }

  #[tokio::test]
  async fn test_api_offline_miss_returns_json_503() {
    let f = fixture();
    f.network.set_offline(true);

    let response = f.run(get("/api/customers")).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_passthrough_never_touches_cache() {
    let f = fixture();
    f.seed("/health", "cached");
    f.network.respond("/health", 200, "ok");

    let response = f.run(get("/health")).await.unwrap();
    assert_eq!(response.text(), "ok");
    assert_eq!(f.cached("/health").as_deref(), Some("cached"));
  }

  #[tokio::test]
  async fn test_offline_order_is_queued_and_accepted() {
    let f = fixture();
    let mut inbox = f.clients.subscribe();
    f.network.set_offline(true);

    let order = json!({"customer": "A", "items": [{"sku": "KLM-1", "qty": 2}]});
    let request = Request::post_json(origin().join("/api/orders").unwrap(), &order);
    let response = f.run(request).await.unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(response.header("X-Offline-Queued"), Some("1"));
    let pending: Vec<_> = f.outbox.list_pending().collect::<Result<_, _>>().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, order);
    assert_eq!(
      inbox.recv().await.unwrap(),
      ClientMessage::OrderQueued { id: pending[0].id }
    );
  }

  #[tokio::test]
  async fn test_queued_order_keeps_key_of_live_attempt() {
    let f = fixture();
    f.network.set_offline(true);

    let request = Request::post_json(origin().join("/api/orders").unwrap(), &json!({"n": 1}));
    f.run(request).await.unwrap();

    let sent = f.network.calls()[0].idempotency_key.clone();
    assert!(sent.is_some());
    let pending: Vec<_> = f.outbox.list_pending().collect::<Result<_, _>>().unwrap();
    assert_eq!(Some(pending[0].idempotency_key.clone()), sent);
  }

  #[tokio::test]
  async fn test_order_keeps_caller_supplied_key() {
    let f = fixture();
    f.network.respond("/api/orders", 201, "{}");

    let request = Request::post_json(origin().join("/api/orders").unwrap(), &json!({"n": 1}))
      .with_header("Idempotency-Key", "cart-42");
    f.run(request).await.unwrap();

    let calls = f.network.calls();
    assert_eq!(calls[0].idempotency_key.as_deref(), Some("cart-42"));
  }

  #[tokio::test]
  async fn test_vary_headers_still_reach_install_entries() {
    let f = fixture_with_vary(vec!["Accept-Language".to_string()]);
    f.seed("/static/js/app.js", "app()");
    f.seed("/static/images/urun_yok.png", "placeholder");
    f.seed("/offline", "offline page");
    f.network.set_offline(true);

    let plain = f.run(get("/static/js/app.js")).await.unwrap();
    assert_eq!(plain.text(), "app()");

    let localized = f
      .run(get("/static/js/app.js").with_header("Accept-Language", "tr"))
      .await
      .unwrap();
    assert_eq!(localized.text(), "app()");

    let image = f
      .run(
        get("/static/images/products/7.jpg")
          .with_destination(Destination::Image)
          .with_header("Accept-Language", "tr"),
      )
      .await
      .unwrap();
    assert_eq!(image.text(), "placeholder");

    let page = f
      .run(Request::navigate(origin().join("/orders").unwrap()).with_header("Accept-Language", "tr"))
      .await
      .unwrap();
    assert_eq!(page.text(), "offline page");
  }

  #[tokio::test]
  async fn test_online_order_rejection_is_returned_not_queued() {
    let f = fixture();
    f.network.respond("/api/orders", 422, r#"{"detail":"invalid"}"#);

    let request = Request::post_json(origin().join("/api/orders").unwrap(), &json!({}));
    let response = f.run(request).await.unwrap();

    assert_eq!(response.status, 422);
    assert_eq!(f.outbox.counts().unwrap().pending, 0);
  }
}
