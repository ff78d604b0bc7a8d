//! Route classification: which strategy serves a request.
//!
//! Rules are evaluated in order and the first match wins. Classification
//! looks only at request metadata (method, URL, mode, destination) and never
//! touches the network or the cache.

use serde::Deserialize;
use url::Url;

use crate::http::{Destination, Request};

/// Caching policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyId {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  #[serde(alias = "network-only-passthrough")]
  Passthrough,
  /// Order creation: forward, queue durably on transport failure
  OrderOutbox,
}

/// Request predicate of a route rule.
///
/// Path matchers apply to same-origin requests only, so a CDN URL that
/// happens to contain `/static/` is not mistaken for a local asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
  PathPrefix(String),
  PathSuffix(String),
  Path(String),
  Destination(Destination),
  /// Top-level page navigations
  Navigate,
  Method(String),
  NotMethod(String),
  /// Any request to a different origin than the portal
  CrossOrigin,
  /// Every inner matcher must match
  All(Vec<Matcher>),
  /// In-code predicate; not expressible in the config file
  #[serde(skip)]
  Predicate(fn(&Request) -> bool),
}

impl Matcher {
  pub fn matches(&self, request: &Request, origin: &Url) -> bool {
    let same_origin = request.is_same_origin(origin);
    let path = request.url.path();

    match self {
      Self::PathPrefix(prefix) => same_origin && path.starts_with(prefix.as_str()),
      Self::PathSuffix(suffix) => same_origin && path.ends_with(suffix.as_str()),
      Self::Path(exact) => same_origin && path == exact.as_str(),
      Self::Destination(d) => request.destination == *d,
      Self::Navigate => request.is_navigation(),
      Self::Method(m) => request.method.as_str().eq_ignore_ascii_case(m),
      Self::NotMethod(m) => !request.method.as_str().eq_ignore_ascii_case(m),
      Self::CrossOrigin => !same_origin,
      Self::All(inner) => inner.iter().all(|m| m.matches(request, origin)),
      Self::Predicate(f) => f(request),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
  /// Written as a map in YAML, e.g. `match: { path_prefix: "/static/" }`
  #[serde(rename = "match", with = "serde_yaml::with::singleton_map_recursive")]
  pub matcher: Matcher,
  pub strategy: StrategyId,
  /// Cached URL served when this route's network fetch fails
  #[serde(default)]
  pub fallback: Option<String>,
}

impl RouteRule {
  pub fn new(matcher: Matcher, strategy: StrategyId) -> Self {
    Self {
      matcher,
      strategy,
      fallback: None,
    }
  }

  pub fn with_fallback(mut self, fallback: &str) -> Self {
    self.fallback = Some(fallback.to_string());
    self
  }
}

/// Outcome of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
  pub strategy: StrategyId,
  pub fallback: Option<&'a str>,
}

/// Ordered, immutable rule table.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
  rules: Vec<RouteRule>,
  origin: Url,
}

impl RouteClassifier {
  pub fn new(rules: Vec<RouteRule>, origin: Url) -> Self {
    Self { rules, origin }
  }

  pub fn classify(&self, request: &Request) -> Route<'_> {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(request, &self.origin))
      .map(|rule| Route {
        strategy: rule.strategy,
        fallback: rule.fallback.as_deref(),
      })
      .unwrap_or(Route {
        strategy: StrategyId::Passthrough,
        fallback: None,
      })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }
}

/// The portal's route table.
///
/// Navigations are network-first so previously visited pages stay readable
/// offline; the offline page covers the rest.
pub fn default_rules(orders_path: &str) -> Vec<RouteRule> {
  vec![
    RouteRule::new(
      Matcher::All(vec![
        Matcher::Method("POST".into()),
        Matcher::Path(orders_path.to_string()),
      ]),
      StrategyId::OrderOutbox,
    ),
    RouteRule::new(Matcher::NotMethod("GET".into()), StrategyId::Passthrough),
    RouteRule::new(Matcher::Navigate, StrategyId::NetworkFirst),
    RouteRule::new(
      Matcher::PathPrefix("/api/".into()),
      StrategyId::StaleWhileRevalidate,
    ),
    RouteRule::new(
      Matcher::Destination(Destination::Image),
      StrategyId::CacheFirst,
    )
    .with_fallback("/static/images/urun_yok.png"),
    RouteRule::new(Matcher::PathPrefix("/static/".into()), StrategyId::CacheFirst),
    RouteRule::new(Matcher::CrossOrigin, StrategyId::CacheFirst),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::resolve;
  use reqwest::Method;

  fn origin() -> Url {
    Url::parse("http://localhost:8000/").unwrap()
  }

  fn classifier() -> RouteClassifier {
    RouteClassifier::new(default_rules("/api/orders"), origin())
  }

  fn get(path: &str) -> Request {
    Request::get(resolve(&origin(), path).unwrap())
  }

  #[test]
  fn test_order_post_goes_to_outbox() {
    let req = Request::post_json(
      resolve(&origin(), "/api/orders").unwrap(),
      &serde_json::json!({}),
    );
    assert_eq!(classifier().classify(&req).strategy, StrategyId::OrderOutbox);
  }

  #[test]
  fn test_other_mutations_pass_through() {
    let req = Request::new(
      Method::PUT,
      resolve(&origin(), "/api/orders/7/status").unwrap(),
    );
    assert_eq!(classifier().classify(&req).strategy, StrategyId::Passthrough);
  }

  #[test]
  fn test_navigation_beats_api_prefix() {
    let req = Request::navigate(resolve(&origin(), "/api/orders").unwrap());
    assert_eq!(classifier().classify(&req).strategy, StrategyId::NetworkFirst);
  }

  #[test]
  fn test_api_reads_are_revalidated() {
    assert_eq!(
      classifier().classify(&get("/api/products")).strategy,
      StrategyId::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_images_carry_placeholder_fallback() {
    let req = get("/static/images/products/123.jpg").with_destination(Destination::Image);
    let table = classifier();
    let route = table.classify(&req);
    assert_eq!(route.strategy, StrategyId::CacheFirst);
    assert_eq!(route.fallback, Some("/static/images/urun_yok.png"));
  }

  #[test]
  fn test_cdn_assets_are_cache_first() {
    let req = Request::get(
      Url::parse("https://cdn.jsdelivr.net/npm/bootstrap@5.3.0-alpha1/dist/js/bootstrap.bundle.min.js")
        .unwrap(),
    );
    let table = classifier();
    let route = table.classify(&req);
    assert_eq!(route.strategy, StrategyId::CacheFirst);
    assert_eq!(route.fallback, None);
  }

  #[test]
  fn test_unmatched_falls_through_to_passthrough() {
    assert_eq!(
      classifier().classify(&get("/health")).strategy,
      StrategyId::Passthrough
    );
  }

  #[test]
  fn test_first_match_wins() {
    let rules = vec![
      RouteRule::new(Matcher::PathSuffix(".css".into()), StrategyId::NetworkFirst),
      RouteRule::new(Matcher::PathPrefix("/static/".into()), StrategyId::CacheFirst),
    ];
    let c = RouteClassifier::new(rules, origin());
    assert_eq!(
      c.classify(&get("/static/css/site.css")).strategy,
      StrategyId::NetworkFirst
    );
    assert_eq!(
      c.classify(&get("/static/js/site.js")).strategy,
      StrategyId::CacheFirst
    );
  }

  #[test]
  fn test_predicate_matcher() {
    fn has_query(req: &Request) -> bool {
      req.url.query().is_some()
    }
    let rules = vec![RouteRule::new(
      Matcher::Predicate(has_query),
      StrategyId::NetworkFirst,
    )];
    let c = RouteClassifier::new(rules, origin());
    assert_eq!(
      c.classify(&get("/products?page=2")).strategy,
      StrategyId::NetworkFirst
    );
    assert_eq!(c.classify(&get("/products")).strategy, StrategyId::Passthrough);
  }

  #[test]
  fn test_classification_is_deterministic() {
    let c = classifier();
    let req = get("/static/js/jquery.min.js");
    let first = c.classify(&req);
    for _ in 0..10 {
      assert_eq!(c.classify(&req), first);
    }
  }
}
