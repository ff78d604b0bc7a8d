//! Network seam: everything that leaves the device goes through `Network`.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::http::{Request, Response, ResponseSource};

/// Transport used by the strategies, the provisioner and the sync orchestrator.
///
/// `Ok` means a response arrived, whatever its status. `Err` means nothing
/// came back.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("portal-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    let url = request.url.to_string();

    let mut builder = self.client.request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError::new(&url, e.to_string()))?;

    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();

    // A connection dropped mid-body is still "no response".
    let body = response
      .bytes()
      .await
      .map_err(|e| TransportError::new(&url, format!("body read failed: {}", e)))?;

    Ok(Response {
      url: final_url,
      status,
      headers,
      body: body.to_vec(),
      source: ResponseSource::Network,
    })
  }
}
