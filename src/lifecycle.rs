//! Lifecycle of one cache generation: install, wait, activate, serve.
//!
//! A single `LifecycleController` owns all process-wide state. Install,
//! activation and clearing are serialized through one sequencer so pruning
//! can never delete a store that is still being populated.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheResult, CacheStorage, CacheWriter, GenerationManager, RequestKey, StorePurpose,
  StoredResponse,
};
use crate::clients::Clients;
use crate::config::Config;
use crate::error::CacheError;
use crate::messages::ControlMessage;
use crate::net::{Credentials, Destination, Fetcher, Request, Response};
use crate::router::{Route, Router};
use crate::strategy::StrategyEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Active,
}

/// Outcome of pre-populating one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreFill {
  pub store: String,
  pub cached: usize,
  /// URLs that could not be fetched or were not cacheable
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub assets: StoreFill,
  pub external: StoreFill,
}

/// Reply to a clear-cache command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

pub struct LifecycleController {
  generations: GenerationManager,
  engine: StrategyEngine,
  router: Router,
  storage: Arc<dyn CacheStorage>,
  clients: Arc<dyn Clients>,
  assets: Vec<Url>,
  external_resources: Vec<Url>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  /// Held by install, activate and clear
  sequencer: tokio::sync::Mutex<()>,
}

impl LifecycleController {
  /// Build the controller. Must be called inside a tokio runtime, since it
  /// spawns the background cache writer.
  pub fn new(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<dyn Clients>,
  ) -> Result<Self> {
    let generations = GenerationManager::new(
      Arc::clone(&storage),
      &config.app.namespace,
      &config.app.cache_version,
    );

    let assets = config
      .assets
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let external_resources = config
      .external_resources
      .iter()
      .map(|u| Url::parse(u).map_err(|e| eyre!("Invalid external resource '{}': {}", u, e)))
      .collect::<Result<Vec<_>>>()?;

    let fallback = RequestKey::new("GET", &config.resolve(&config.app.fallback_document)?);
    let writer = CacheWriter::spawn(Arc::clone(&storage));
    let engine = StrategyEngine::new(
      Arc::clone(&storage),
      fetcher,
      writer,
      generations.store_name(StorePurpose::Static),
      fallback,
    );

    Ok(Self {
      generations,
      engine,
      router: Router::new(config),
      storage,
      clients,
      assets,
      external_resources,
      state: Mutex::new(LifecycleState::Installing),
      skip_waiting: AtomicBool::new(false),
      sequencer: tokio::sync::Mutex::new(()),
    })
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, next: LifecycleState) {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    debug!(from = ?*state, to = ?next, "lifecycle transition");
    *state = next;
  }

  pub fn generations(&self) -> &GenerationManager {
    &self.generations
  }

  /// Create the current generation and pre-populate it.
  ///
  /// Individual asset failures are logged and counted, never fatal. Ends in
  /// `Waiting`, or `Activating` if skip-waiting was signalled meanwhile.
  pub async fn install(&self) -> Result<InstallReport> {
    let _sequence = self.sequencer.lock().await;

    let state = self.state();
    if state != LifecycleState::Installing {
      return Err(eyre!("Cannot install from state {:?}", state));
    }

    self.generations.ensure_generations()?;

    let asset_requests: Vec<Request> = self
      .assets
      .iter()
      .map(|url| Request::get(url.clone(), Destination::Other))
      .collect();
    let external_requests: Vec<Request> = self
      .external_resources
      .iter()
      .map(|url| Request::get(url.clone(), Destination::Other).with_credentials(Credentials::Omit))
      .collect();

    let (assets, external) = tokio::join!(
      self.populate(StorePurpose::Static, asset_requests),
      self.populate(StorePurpose::Cdn, external_requests),
    );
    // Until this lands, a restart installs again instead of activating
    self.generations.mark_installed()?;

    let next = if self.skip_waiting.load(Ordering::SeqCst) {
      LifecycleState::Activating
    } else {
      LifecycleState::Waiting
    };
    self.set_state(next);

    info!(
      version = %self.generations.version(),
      assets = assets.cached,
      assets_failed = assets.failed.len(),
      external = external.cached,
      external_failed = external.failed.len(),
      "generation installed"
    );

    Ok(InstallReport { assets, external })
  }

  /// Fetch every request concurrently and store what comes back cacheable.
  async fn populate(&self, purpose: StorePurpose, requests: Vec<Request>) -> StoreFill {
    let store = self.generations.store_name(purpose);
    let store_name = store.as_str();
    let fetcher = self.engine.fetcher();

    let results = join_all(requests.iter().map(|request| async move {
      let response = fetcher.fetch(request).await?;
      if !response.is_cacheable() {
        return Err(CacheError::NonCacheableResponse {
          url: request.url.to_string(),
          status: response.status,
        });
      }
      let key = RequestKey::from_request(request);
      self
        .storage
        .put(store_name, &key, &response)
        .map_err(|e| CacheError::StoreWriteFailure {
          store: store_name.to_string(),
          key: key.to_string(),
          reason: e.to_string(),
        })
    }))
    .await;

    let mut fill = StoreFill {
      store: store.clone(),
      ..Default::default()
    };
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(()) => fill.cached += 1,
        Err(e) => {
          warn!(store = %store, error = %e, "pre-population skipped");
          fill.failed.push(request.url.to_string());
        }
      }
    }
    fill
  }

  /// Skip the waiting phase. Takes effect immediately when waiting, or at the
  /// end of an install that is still running.
  pub fn skip_waiting(&self) -> LifecycleState {
    self.skip_waiting.store(true, Ordering::SeqCst);
    if self.state() == LifecycleState::Waiting {
      self.set_state(LifecycleState::Activating);
    }
    self.state()
  }

  /// Cut over to the current generation: prune older generations, claim
  /// open clients, start intercepting. Returns the pruned store names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let _sequence = self.sequencer.lock().await;

    let state = self.state();
    if !matches!(state, LifecycleState::Waiting | LifecycleState::Activating) {
      return Err(eyre!("Cannot activate from state {:?}", state));
    }
    self.set_state(LifecycleState::Activating);

    let pruned = match self.generations.prune_stale() {
      Ok(pruned) => pruned,
      Err(e) => {
        warn!(error = %e, "failed to prune stale generations");
        Vec::new()
      }
    };

    if let Err(e) = self.clients.claim().await {
      warn!(error = %e, "failed to claim clients");
    }

    self.set_state(LifecycleState::Active);
    info!(version = %self.generations.version(), pruned = pruned.len(), "generation active");
    Ok(pruned)
  }

  /// Bring up a process whose generation may already be installed. An
  /// installed generation is activated directly; otherwise it is installed
  /// first.
  pub async fn resume(&self) -> Result<Vec<String>> {
    if self.state() == LifecycleState::Installing {
      if self.generations.is_installed()? {
        debug!(version = %self.generations.version(), "generation already installed");
        self.set_state(LifecycleState::Activating);
      } else {
        self.install().await?;
      }
    }
    self.activate().await
  }

  /// Answer one intercepted request.
  ///
  /// Before activation, and for pass-through routes, the request goes to the
  /// network untouched.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>, CacheError> {
    let rule = self.router.classify(request);

    let route = if self.state() == LifecycleState::Active {
      rule.route
    } else {
      Route::PassThrough
    };

    match route {
      Route::PassThrough => {
        debug!(url = %request.url, "pass-through");
        let response = self.engine.fetcher().fetch(request).await?;
        Ok(CacheResult::from_network(response))
      }
      Route::Intercept { strategy, purpose } => {
        let store = self.generations.store_name(purpose);
        debug!(url = %request.url, rule = rule.name, store = %store, "intercepted");
        self.engine.run(strategy, request, &store).await
      }
    }
  }

  /// The stored entry `handle` would consult for `request`, without going
  /// to the network.
  pub fn peek(&self, request: &Request) -> Result<StoredResponse> {
    let store = match self.router.route(request) {
      Route::Intercept { purpose, .. } => self.generations.store_name(purpose),
      Route::PassThrough => return Err(eyre!("{} is never cached", request.url)),
    };
    let key = RequestKey::from_request(request);
    match self.storage.lookup(&store, &key)? {
      Some(stored) => Ok(stored),
      None => Err(
        CacheError::StoreMiss {
          store,
          key: key.to_string(),
        }
        .into(),
      ),
    }
  }

  /// Delete every store, whatever its version. Does not change state.
  pub async fn clear_all(&self) -> ClearReport {
    let _sequence = self.sequencer.lock().await;
    // Let queued writes land first. A request handled concurrently may still
    // queue a write after this and recreate its store, which is harmless.
    self.engine.writer().flush().await;

    match self.generations.clear_all() {
      Ok(_) => ClearReport {
        success: true,
        error: None,
      },
      Err(e) => {
        warn!(error = %e, "failed to clear caches");
        ClearReport {
          success: false,
          error: Some(e.to_string()),
        }
      }
    }
  }

  /// Apply a control message. Returns the reply, if the message has one.
  pub async fn handle_message(&self, message: ControlMessage) -> Option<ClearReport> {
    match message {
      ControlMessage::SkipWaiting => {
        let state = self.skip_waiting();
        info!(state = ?state, "skip waiting requested");
        None
      }
      ControlMessage::ClearCache => Some(self.clear_all().await),
    }
  }

  /// Wait for queued cache writes to land.
  pub async fn flush(&self) {
    self.engine.writer().flush().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, SqliteStorage};
  use crate::messages::tests::RecordingClients;
  use crate::strategy::tests::MockFetcher;

  struct Harness {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<MockFetcher>,
    clients: Arc<RecordingClients>,
    controller: LifecycleController,
  }

  fn harness_with(storage: Arc<dyn CacheStorage>) -> Harness {
    let config = Config::sample();
    let fetcher = Arc::new(MockFetcher::new());
    for path in ["/", "/index.html", "/app.js"] {
      fetcher.respond(
        config.resolve(path).unwrap().as_str(),
        Response::new(200, format!("body of {}", path)),
      );
    }
    // /styles.css is missing from the network
    fetcher.respond(
      "https://fonts.googleapis.com/css2?family=Inter",
      Response::new(200, "@font-face {}"),
    );
    fetcher.respond(
      "https://cdnjs.cloudflare.com/ajax/libs/lodash/4.17.21/lodash.min.js",
      Response::new(500, "oops"),
    );

    let clients = Arc::new(RecordingClients::default());
    let controller =
      LifecycleController::new(&config, storage.clone(), fetcher.clone(), clients.clone()).unwrap();
    Harness {
      storage,
      fetcher,
      clients,
      controller,
    }
  }

  fn harness() -> Harness {
    harness_with(Arc::new(MemoryStorage::new()))
  }

  fn get(url: &str, destination: Destination) -> Request {
    Request::get(Url::parse(url).unwrap(), destination)
  }

  #[tokio::test]
  async fn test_install_is_best_effort() {
    let h = harness();

    let report = h.controller.install().await.unwrap();

    assert_eq!(h.controller.state(), LifecycleState::Waiting);
    assert_eq!(report.assets.store, "breathe-v2-static");
    assert_eq!(report.assets.cached, 3);
    assert_eq!(
      report.assets.failed,
      vec!["https://breathe.example.com/styles.css".to_string()]
    );
    assert_eq!(report.external.cached, 1);
    assert_eq!(report.external.failed.len(), 1);
    assert_eq!(h.storage.keys("breathe-v2-static").unwrap().len(), 3);
    assert_eq!(h.storage.keys("breathe-v2-cdn").unwrap().len(), 1);
    assert!(h.storage.has_store("breathe-v2-api").unwrap());
  }

  #[tokio::test]
  async fn test_external_resources_fetched_without_credentials() {
    let h = harness();
    h.controller.install().await.unwrap();

    for request in h.fetcher.seen() {
      let external = request.url.host_str() != Some("breathe.example.com");
      assert_eq!(request.credentials == Credentials::Omit, external);
    }
  }

  #[tokio::test]
  async fn test_skip_waiting_after_install() {
    let h = harness();
    h.controller.install().await.unwrap();

    assert_eq!(h.controller.skip_waiting(), LifecycleState::Activating);
  }

  #[tokio::test]
  async fn test_skip_waiting_during_install_ends_in_activating() {
    let h = harness();
    assert_eq!(h.controller.skip_waiting(), LifecycleState::Installing);

    h.controller.install().await.unwrap();

    assert_eq!(h.controller.state(), LifecycleState::Activating);
  }

  #[tokio::test]
  async fn test_activate_prunes_and_claims() {
    let h = harness();
    for name in ["breathe-v1-static", "breathe-v1-api", "breathe-v1-cdn", "unrelated"] {
      h.storage.open_store(name).unwrap();
    }
    h.controller.install().await.unwrap();

    let mut pruned = h.controller.activate().await.unwrap();
    pruned.sort();

    assert_eq!(pruned, vec!["breathe-v1-api", "breathe-v1-cdn", "breathe-v1-static"]);
    assert_eq!(h.controller.state(), LifecycleState::Active);
    assert_eq!(h.clients.claims.load(Ordering::SeqCst), 1);
    assert_eq!(
      h.storage.store_names().unwrap(),
      vec!["breathe-v2-api", "breathe-v2-cdn", "breathe-v2-static", "unrelated"]
    );
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let h = harness();
    assert!(h.controller.activate().await.is_err());
    assert!(h.controller.install().await.is_ok());
    assert!(h.controller.install().await.is_err());
  }

  #[tokio::test]
  async fn test_resume_skips_install_when_generation_exists() {
    let h = harness();
    h.controller.generations().ensure_generations().unwrap();
    h.controller.generations().mark_installed().unwrap();

    h.controller.resume().await.unwrap();

    assert_eq!(h.controller.state(), LifecycleState::Active);
    assert_eq!(h.fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_resume_after_interrupted_install_keeps_old_generation_until_filled() {
    let h = harness();
    let index = get("https://breathe.example.com/index.html", Destination::Document);
    h.storage
      .put(
        "breathe-v1-static",
        &RequestKey::from_request(&index),
        &Response::new(200, "old index"),
      )
      .unwrap();
    // Stores of the new generation exist, but were never filled
    h.controller.generations().ensure_generations().unwrap();

    let pruned = h.controller.resume().await.unwrap();

    assert_eq!(h.fetcher.calls(), 6);
    assert_eq!(pruned, vec!["breathe-v1-static"]);
    assert_eq!(h.storage.keys("breathe-v2-static").unwrap().len(), 3);
    assert!(h.controller.generations().is_installed().unwrap());

    h.fetcher.go_offline();
    let result = h
      .controller
      .handle(&get("https://breathe.example.com/", Destination::Document))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Store);
    assert_eq!(result.data.status, 200);
  }

  #[tokio::test]
  async fn test_activate_waits_for_running_install() {
    let h = harness();
    h.storage.open_store("breathe-v1-static").unwrap();
    h.fetcher.hold();

    let (installed, activated, ()) = tokio::join!(
      h.controller.install(),
      async {
        while h.fetcher.calls() == 0 {
          tokio::task::yield_now().await;
        }
        h.controller.activate().await
      },
      async {
        while h.fetcher.calls() == 0 {
          tokio::task::yield_now().await;
        }
        for _ in 0..20 {
          tokio::task::yield_now().await;
        }
        // Activation is queued behind the install, nothing pruned yet
        assert_eq!(h.controller.state(), LifecycleState::Installing);
        assert!(h.storage.has_store("breathe-v1-static").unwrap());
        h.fetcher.release();
      },
    );

    assert_eq!(installed.unwrap().assets.cached, 3);
    assert_eq!(activated.unwrap(), vec!["breathe-v1-static"]);
    assert_eq!(h.controller.state(), LifecycleState::Active);
    for name in h.controller.generations().current_stores() {
      assert!(h.storage.has_store(&name).unwrap());
    }
    assert_eq!(h.storage.keys("breathe-v2-static").unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_resume_installs_fresh_generation() {
    let h = harness();
    h.controller.resume().await.unwrap();

    assert_eq!(h.controller.state(), LifecycleState::Active);
    assert_eq!(h.storage.keys("breathe-v2-static").unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_requests_pass_through_before_activation() {
    let h = harness();
    let request = get("https://breathe.example.com/app.js", Destination::Script);

    let result = h.controller.handle(&request).await.unwrap();
    h.controller.flush().await;

    assert_eq!(result.source, CacheSource::Network);
    assert!(!h.storage.has_store("breathe-v2-static").unwrap());
  }

  #[tokio::test]
  async fn test_cached_script_served_without_network() {
    let h = harness();
    h.controller.resume().await.unwrap();
    let calls_after_install = h.fetcher.calls();

    let request = get("https://breathe.example.com/app.js", Destination::Script);
    let result = h.controller.handle(&request).await.unwrap();

    assert_eq!(h.fetcher.calls(), calls_after_install);
    assert_eq!(result.source, CacheSource::Store);
    assert_eq!(result.data.body.as_ref(), b"body of /app.js");
  }

  #[tokio::test]
  async fn test_cdn_font_is_fetched_and_stored() {
    let h = harness();
    h.controller.resume().await.unwrap();
    let url = "https://fonts.gstatic.com/font.woff2";
    h.fetcher.respond(url, Response::new(200, "wOF2"));

    let result = h.controller.handle(&get(url, Destination::Font)).await.unwrap();
    h.controller.flush().await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 200);
    let keys = h.storage.keys("breathe-v2-cdn").unwrap();
    let font_key = keys.iter().find(|k| k.url.ends_with("font.woff2")).unwrap();
    let stored = h.storage.lookup("breathe-v2-cdn", font_key).unwrap().unwrap();
    assert_eq!(stored.response, result.data);
  }

  #[tokio::test]
  async fn test_offline_uncached_document_gets_offline_page() {
    let h = harness_with(Arc::new(MemoryStorage::new()));
    h.controller.generations().ensure_generations().unwrap();
    h.controller.generations().mark_installed().unwrap();
    h.controller.resume().await.unwrap();
    h.fetcher.go_offline();

    let result = h
      .controller
      .handle(&get("https://breathe.example.com/", Destination::Document))
      .await
      .unwrap();

    assert_eq!(result.data.status, 503);
    let body = String::from_utf8(result.data.body.to_vec()).unwrap();
    assert!(body.contains("offline"));
  }

  #[tokio::test]
  async fn test_api_request_routed_to_api_store() {
    let h = harness();
    h.controller.resume().await.unwrap();
    let url = "https://breathe.example.com/api/sessions";
    h.fetcher.respond(url, Response::new(200, "[]"));

    h.controller.handle(&get(url, Destination::Other)).await.unwrap();
    h.controller.flush().await;

    assert_eq!(h.storage.keys("breathe-v2-api").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_post_is_never_stored() {
    let h = harness();
    h.controller.resume().await.unwrap();
    let url = "https://breathe.example.com/api/sessions";
    h.fetcher.respond(url, Response::new(200, "created"));

    let request = get(url, Destination::Other).with_method(reqwest::Method::POST);
    h.controller.handle(&request).await.unwrap();
    h.controller.flush().await;

    assert!(h.storage.keys("breathe-v2-api").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_peek_reads_routed_store() {
    let h = harness();
    h.controller.resume().await.unwrap();

    let cached = h
      .controller
      .peek(&get("https://breathe.example.com/index.html", Destination::Document))
      .unwrap();
    assert_eq!(cached.response.body.as_ref(), b"body of /index.html");

    let miss = h
      .controller
      .peek(&get("https://breathe.example.com/api/none", Destination::Other))
      .unwrap_err();
    assert!(matches!(
      miss.downcast_ref::<CacheError>(),
      Some(CacheError::StoreMiss { .. })
    ));

    let post = get("https://breathe.example.com/", Destination::Document)
      .with_method(reqwest::Method::POST);
    assert!(h.controller.peek(&post).is_err());
    assert_eq!(h.fetcher.calls(), 6);
  }

  #[tokio::test]
  async fn test_clear_all_deletes_every_store() {
    let h = harness_with(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    h.controller.resume().await.unwrap();
    assert_eq!(h.storage.store_names().unwrap().len(), 3);

    let report = h.controller.clear_all().await;

    assert_eq!(
      report,
      ClearReport {
        success: true,
        error: None
      }
    );
    assert_eq!(serde_json::to_string(&report).unwrap(), r#"{"success":true}"#);
    assert!(h.storage.store_names().unwrap().is_empty());
    assert_eq!(h.controller.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_control_messages() {
    let h = harness();
    h.controller.install().await.unwrap();

    assert_eq!(
      h.controller.handle_message(ControlMessage::SkipWaiting).await,
      None
    );
    assert_eq!(h.controller.state(), LifecycleState::Activating);

    let reply = h.controller.handle_message(ControlMessage::ClearCache).await;
    assert_eq!(reply.map(|r| r.success), Some(true));
  }
}
