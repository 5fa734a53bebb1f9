use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::CacheError;

use super::types::{Request, Response};

/// Anything that can turn a request into a response over the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Perform the request. Any HTTP status is a successful fetch; only a
  /// transport-level problem is a `NetworkFailure`.
  async fn fetch(&self, request: &Request) -> Result<Response, CacheError>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    // Redirects are handed back to the caller untouched instead of being
    // followed, so they never end up in a store.
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .redirect(reqwest::redirect::Policy::none())
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, CacheError> {
    let network_failure = |e: reqwest::Error| CacheError::NetworkFailure {
      url: request.url.to_string(),
      reason: e.to_string(),
    };

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in request.outgoing_headers() {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let reply = builder.send().await.map_err(network_failure)?;

    let status = reply.status();
    let headers = reply
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = reply.bytes().await.map_err(network_failure)?;

    debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "fetched");

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body,
    })
  }
}
