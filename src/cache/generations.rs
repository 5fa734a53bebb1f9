//! Versioned store generations.
//!
//! Store names look like `{cache_version}-{purpose}`, where the cache version
//! itself starts with the application namespace (`breathe-v2-static`). Any
//! store inside the namespace that does not carry the current version belongs
//! to an older generation.

use color_eyre::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;

/// What a store in a generation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorePurpose {
  Static,
  Api,
  Cdn,
}

impl StorePurpose {
  pub const ALL: [StorePurpose; 3] = [StorePurpose::Static, StorePurpose::Api, StorePurpose::Cdn];

  pub fn as_str(self) -> &'static str {
    match self {
      StorePurpose::Static => "static",
      StorePurpose::Api => "api",
      StorePurpose::Cdn => "cdn",
    }
  }
}

impl fmt::Display for StorePurpose {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Owns the set of generation-tagged stores for one application.
#[derive(Clone)]
pub struct GenerationManager {
  storage: Arc<dyn CacheStorage>,
  namespace: String,
  version: String,
}

impl GenerationManager {
  pub fn new(storage: Arc<dyn CacheStorage>, namespace: &str, version: &str) -> Self {
    Self {
      storage,
      namespace: namespace.to_string(),
      version: version.to_string(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name of the current generation's store for `purpose`.
  pub fn store_name(&self, purpose: StorePurpose) -> String {
    format!("{}-{}", self.version, purpose)
  }

  /// Names of all three current stores.
  pub fn current_stores(&self) -> Vec<String> {
    StorePurpose::ALL
      .iter()
      .map(|p| self.store_name(*p))
      .collect()
  }

  /// Create the current generation's stores if absent. Safe to repeat.
  pub fn ensure_generations(&self) -> Result<Vec<String>> {
    let names = self.current_stores();
    for name in &names {
      self.storage.open_store(name)?;
    }
    debug!(version = %self.version, "generation stores ready");
    Ok(names)
  }

  /// Record that pre-population of the current generation finished.
  pub fn mark_installed(&self) -> Result<()> {
    for name in self.current_stores() {
      self.storage.seal_store(&name)?;
    }
    debug!(version = %self.version, "generation sealed");
    Ok(())
  }

  /// Whether the current generation finished installing. Stores that merely
  /// exist, e.g. after an interrupted install, do not count.
  pub fn is_installed(&self) -> Result<bool> {
    for name in self.current_stores() {
      if !self.storage.is_sealed(&name)? {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// A store belongs to an older generation if it is inside our namespace
  /// but not tagged with the current version.
  pub fn is_stale(&self, name: &str) -> bool {
    let in_namespace = name
      .strip_prefix(&self.namespace)
      .is_some_and(|rest| rest.starts_with('-'));
    let current = name
      .strip_prefix(&self.version)
      .is_some_and(|rest| rest.starts_with('-'));
    in_namespace && !current
  }

  /// Delete every stale store. Returns the names that were removed.
  pub fn prune_stale(&self) -> Result<Vec<String>> {
    let mut pruned = Vec::new();
    for name in self.storage.store_names()? {
      if self.is_stale(&name) && self.storage.delete_store(&name)? {
        info!(store = %name, "deleted stale store");
        pruned.push(name);
      }
    }
    Ok(pruned)
  }

  /// Delete every store in the backend, whatever its version or owner.
  pub fn clear_all(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.store_names()? {
      if self.storage.delete_store(&name)? {
        deleted.push(name);
      }
    }
    info!(count = deleted.len(), "cleared all stores");
    Ok(deleted)
  }
}
