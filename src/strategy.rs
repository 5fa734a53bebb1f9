//! The two caching strategies.
//!
//! Both read through `CacheStorage` and hand successful network responses to
//! the background `CacheWriter`, so storing never delays or fails the
//! response going back to the caller.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheResult, CacheStorage, CacheWriter, RequestKey, StoredResponse};
use crate::error::CacheError;
use crate::net::{Destination, Fetcher, Request, Response};
use crate::router::Strategy;

/// Page served for a document that is neither reachable nor cached.
pub const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; min-height: 100vh; margin: 0; color: #444; }
    main { text-align: center; padding: 2rem; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a connection. Check your network and try again.</p>
  </main>
</body>
</html>
"#;

/// Neutral grey square served in place of an unreachable image.
pub const PLACEHOLDER_IMAGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64" viewBox="0 0 64 64"><rect width="64" height="64" fill="#e0e0e0"/></svg>"##;

/// Runs strategies against named stores.
pub struct StrategyEngine {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  writer: CacheWriter,
  /// Store and key of the document served for uncached pages while offline
  fallback: (String, RequestKey),
}

impl StrategyEngine {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    writer: CacheWriter,
    fallback_store: String,
    fallback_document: RequestKey,
  ) -> Self {
    Self {
      storage,
      fetcher,
      writer,
      fallback: (fallback_store, fallback_document),
    }
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
    &self.fetcher
  }

  pub fn writer(&self) -> &CacheWriter {
    &self.writer
  }

  pub async fn run(
    &self,
    strategy: Strategy,
    request: &Request,
    store: &str,
  ) -> Result<CacheResult<Response>, CacheError> {
    match strategy {
      Strategy::OriginPreferred => Ok(self.origin_preferred(request, store).await),
      Strategy::StorePreferred => self.store_preferred(request, store).await,
    }
  }

  /// Network first.
  ///
  /// 1. Fetch - on a cacheable response, queue it for storage and return it
  /// 2. Non-cacheable responses pass through untouched
  /// 3. On network failure, serve the stored entry, then the fallback
  ///    document (documents only), then a synthesized 503
  ///
  /// Always resolves to a response.
  pub async fn origin_preferred(&self, request: &Request, store: &str) -> CacheResult<Response> {
    let key = RequestKey::from_request(request);

    let error = match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_if_cacheable(store, key, &response);
        return CacheResult::from_network(response);
      }
      Err(e) => e,
    };

    debug!(error = %error, store, "network failed, falling back to store");

    if let Some(stored) = self.lookup(store, &key) {
      return CacheResult::from_store(stored);
    }

    if request.is_document() {
      let (fallback_store, fallback_key) = &self.fallback;
      if let Some(stored) = self.lookup(fallback_store, fallback_key) {
        return CacheResult::fallback(stored);
      }
      return CacheResult::synthesized(offline_page());
    }

    CacheResult::synthesized(service_unavailable())
  }

  /// Store first.
  ///
  /// 1. A hit is returned without touching the network
  /// 2. On a miss, fetch - cacheable responses are queued for storage
  /// 3. Failed or non-cacheable image requests get a placeholder image;
  ///    anything else gets the failure (or the non-cacheable response)
  pub async fn store_preferred(
    &self,
    request: &Request,
    store: &str,
  ) -> Result<CacheResult<Response>, CacheError> {
    let key = RequestKey::from_request(request);

    if let Some(stored) = self.lookup(store, &key) {
      return Ok(CacheResult::from_store(stored));
    }

    let is_image = request.destination == Destination::Image;

    match self.fetcher.fetch(request).await {
      Ok(response) if response.is_cacheable() => {
        self.store_if_cacheable(store, key, &response);
        Ok(CacheResult::from_network(response))
      }
      Ok(_) if is_image => Ok(CacheResult::synthesized(placeholder_image())),
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(_) if is_image => Ok(CacheResult::synthesized(placeholder_image())),
      Err(e) => Err(e),
    }
  }

  /// Queue a response for storage unless its status rules that out.
  fn store_if_cacheable(&self, store: &str, key: RequestKey, response: &Response) {
    if response.is_cacheable() {
      self.writer.enqueue(store, key, response.clone());
    } else {
      let skipped = CacheError::NonCacheableResponse {
        url: key.url,
        status: response.status,
      };
      debug!(reason = %skipped, "not storing");
    }
  }

  /// Store read; a failing store counts as a miss.
  fn lookup(&self, store: &str, key: &RequestKey) -> Option<StoredResponse> {
    match self.storage.lookup(store, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(store, key = %key, error = %e, "store read failed");
        None
      }
    }
  }
}

/// Minimal offline HTML page.
pub fn offline_page() -> Response {
  Response::new(503, OFFLINE_PAGE)
    .with_header("Content-Type", "text/html; charset=utf-8")
    .with_header("Cache-Control", "no-store")
}

/// Terse 503 for non-document requests.
pub fn service_unavailable() -> Response {
  Response::new(503, "Service Unavailable")
    .with_header("Content-Type", "text/plain; charset=utf-8")
    .with_header("Cache-Control", "no-store")
}

/// Placeholder served instead of a broken image.
pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_IMAGE)
    .with_header("Content-Type", "image/svg+xml")
    .with_header("Cache-Control", "no-store")
}
