//! Failure taxonomy for the interception layer.
//!
//! None of these are fatal: each one is either recovered locally by a
//! strategy, logged and dropped, or handed back to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
  /// The fetch could not complete (DNS, connect, TLS, timeout, body read).
  #[error("network request to {url} failed: {reason}")]
  NetworkFailure { url: String, reason: String },

  /// The key is absent from the named store.
  #[error("no entry for {key} in store {store}")]
  StoreMiss { store: String, key: String },

  /// Persisting a response failed.
  #[error("failed to write {key} into store {store}: {reason}")]
  StoreWriteFailure {
    store: String,
    key: String,
    reason: String,
  },

  /// Status or response kind rules out caching.
  #[error("response for {url} is not cacheable (status {status})")]
  NonCacheableResponse { url: String, status: u16 },

  /// A push payload could not be parsed.
  #[error("malformed push payload: {0}")]
  MalformedPayload(String),
}
