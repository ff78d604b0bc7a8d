//! Request/response types seen by the interception engine.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Header carrying an order's client-generated deduplication key.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// How the client issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

/// What the response will be used for.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  /// fetch()/XHR and anything else without a destination
  #[default]
  Empty,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      destination: Destination::default(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A top-level document navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  /// A JSON POST, as issued by the cart page when submitting an order.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Self {
    Self {
      body: Some(body.to_string().into_bytes()),
      ..Self::new(Method::POST, url)
    }
    .with_header("Content-Type", "application/json")
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// Where a response handed back to the client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// A registered fallback entry served in place of the requested one
  Fallback,
  /// Built locally; never touched network or cache
  Synthesized,
}

/// A fully buffered response.
///
/// The body is read from the network exactly once; the cached copy and the
/// copy returned to the caller are separate clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: Vec<u8>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: Vec::new(),
      body,
      source: ResponseSource::Network,
    }
  }

  /// A locally built JSON response.
  pub fn json(url: impl Into<String>, status: u16, value: &serde_json::Value) -> Self {
    Self {
      headers: vec![("Content-Type".into(), "application/json".into())],
      source: ResponseSource::Synthesized,
      ..Self::new(url, status, value.to_string().into_bytes())
    }
  }

  /// A locally built HTML response.
  pub fn html(url: impl Into<String>, status: u16, markup: &str) -> Self {
    Self {
      headers: vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
      source: ResponseSource::Synthesized,
      ..Self::new(url, status, markup.as_bytes().to_vec())
    }
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Full 2xx responses may be stored; partial content never is.
  pub fn is_cacheable(&self) -> bool {
    self.is_success() && self.status != 206
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Cache key for a GET request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  url: String,
  digest: String,
}

impl RequestKey {
  /// Derive the key for a request; `None` for anything but GET.
  ///
  /// `vary` names request headers whose values take part in the key. A
  /// header the request does not send leaves the key unchanged, so a request
  /// without any of them maps to the same key as [`RequestKey::for_url`].
  pub fn for_request(request: &Request, vary: &[String]) -> Option<Self> {
    if request.method != Method::GET {
      return None;
    }

    let url = normalize_url(&request.url);
    let mut input = format!("GET {}", url);
    for name in vary {
      if let Some(value) = request.header(name) {
        input.push_str(&format!("\n{}:{}", name.to_ascii_lowercase(), value));
      }
    }

    Some(Self {
      url,
      digest: sha256_hex(&input),
    })
  }

  /// Key for a plain GET of `url` with no negotiated headers.
  pub fn for_url(url: &Url) -> Self {
    let url = normalize_url(url);
    let digest = sha256_hex(&format!("GET {}", url));
    Self { url, digest }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn digest(&self) -> &str {
    &self.digest
  }
}

/// Resolve a manifest or route entry against the portal origin.
///
/// Absolute URLs (third-party CDNs) are returned unchanged.
pub fn resolve(origin: &Url, target: &str) -> Result<Url, url::ParseError> {
  origin.join(target)
}

fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

fn sha256_hex(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
