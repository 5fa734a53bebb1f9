//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::{Request, Response};

/// Normalized identity of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  /// Absolute URL without its fragment
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }

  /// SHA256 of the key, for stable fixed-length storage identifiers.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Snapshot of a response as it was put into a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from a store)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Produced locally because nothing better was available.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

impl CacheResult<Response> {
  /// An exact hit in the target store.
  pub fn from_store(stored: StoredResponse) -> Self {
    Self {
      data: stored.response,
      source: CacheSource::Store,
      cached_at: Some(stored.cached_at),
    }
  }

  /// The stored fallback document, served in place of a missing page.
  pub fn fallback(stored: StoredResponse) -> Self {
    Self {
      data: stored.response,
      source: CacheSource::Fallback,
      cached_at: Some(stored.cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Exact match from a store
  Store,
  /// Offline fallback document from the static store
  Fallback,
  /// Offline page, generic 503 or placeholder image
  Synthesized,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CacheSource::Network => "network",
      CacheSource::Store => "store",
      CacheSource::Fallback => "fallback",
      CacheSource::Synthesized => "synthesized",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Destination;
  use url::Url;

  #[test]
  fn test_key_drops_fragment() {
    let a = RequestKey::new("get", &Url::parse("https://a.example/app.js#v1").unwrap());
    let b = RequestKey::new("GET", &Url::parse("https://a.example/app.js").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.to_string(), "GET https://a.example/app.js");
  }

  #[test]
  fn test_key_keeps_query() {
    let a = RequestKey::new("GET", &Url::parse("https://a.example/x?v=1").unwrap());
    let b = RequestKey::new("GET", &Url::parse("https://a.example/x?v=2").unwrap());
    assert_ne!(a.digest(), b.digest());
  }

  #[test]
  fn test_key_from_request() {
    let url = Url::parse("https://a.example/").unwrap();
    let key = RequestKey::from_request(&Request::get(url, Destination::Document));
    assert_eq!(key.method, "GET");
    assert_eq!(key.digest().len(), 64);
  }
}
