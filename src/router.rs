//! Request classification.
//!
//! Each intercepted request is matched against an ordered table of rules;
//! the first matching rule decides which strategy runs against which store.

use std::collections::HashSet;
use url::Url;

use crate::cache::StorePurpose;
use crate::config::Config;
use crate::net::Request;

/// Which source wins when both the network and a store could answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network first, store on failure
  OriginPreferred,
  /// Store first, network on miss
  StorePreferred,
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Do not intercept; forward to the network untouched
  PassThrough,
  Intercept {
    strategy: Strategy,
    purpose: StorePurpose,
  },
}

/// One row of the routing table.
pub struct RouteRule {
  pub name: &'static str,
  pub matches: fn(&Router, &Request) -> bool,
  pub route: Route,
}

/// Routing table, evaluated top to bottom. API detection must stay ahead of
/// the static-asset rule so API paths ending in `.json` or `.js` are never
/// served stale.
pub const RULES: &[RouteRule] = &[
  RouteRule {
    name: "pass-through",
    matches: Router::is_uncacheable,
    route: Route::PassThrough,
  },
  RouteRule {
    name: "api",
    matches: Router::is_api,
    route: Route::Intercept {
      strategy: Strategy::OriginPreferred,
      purpose: StorePurpose::Api,
    },
  },
  RouteRule {
    name: "cdn",
    matches: Router::is_cdn,
    route: Route::Intercept {
      strategy: Strategy::StorePreferred,
      purpose: StorePurpose::Cdn,
    },
  },
  RouteRule {
    name: "static-asset",
    matches: Router::is_static_asset,
    route: Route::Intercept {
      strategy: Strategy::StorePreferred,
      purpose: StorePurpose::Static,
    },
  },
  RouteRule {
    name: "document",
    matches: Router::is_document,
    route: Route::Intercept {
      strategy: Strategy::OriginPreferred,
      purpose: StorePurpose::Static,
    },
  },
];

/// Applies when no rule in `RULES` matches.
pub static DEFAULT_RULE: RouteRule = RouteRule {
  name: "default",
  matches: Router::any,
  route: Route::Intercept {
    strategy: Strategy::OriginPreferred,
    purpose: StorePurpose::Static,
  },
};

/// Classifies requests for one application origin.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  cdn_hosts: HashSet<String>,
  api_hosts: HashSet<String>,
  static_extensions: HashSet<String>,
  manifest_paths: HashSet<String>,
}

impl Router {
  pub fn new(config: &Config) -> Self {
    let lowercase = |items: &[String]| -> HashSet<String> {
      items.iter().map(|s| s.to_lowercase()).collect()
    };
    let routing = &config.routing;
    Self {
      origin: config.app.origin.clone(),
      cdn_hosts: lowercase(&routing.cdn_hosts),
      api_hosts: lowercase(&routing.api_hosts),
      static_extensions: routing
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      manifest_paths: routing.manifest_paths.iter().cloned().collect(),
    }
  }

  /// Find the rule that applies to `request`.
  pub fn classify(&self, request: &Request) -> &'static RouteRule {
    RULES
      .iter()
      .find(|rule| (rule.matches)(self, request))
      .unwrap_or(&DEFAULT_RULE)
  }

  pub fn route(&self, request: &Request) -> Route {
    self.classify(request).route
  }

  fn host(request: &Request) -> String {
    request
      .url
      .host_str()
      .map(|h| h.to_lowercase())
      .unwrap_or_default()
  }

  fn any(&self, _request: &Request) -> bool {
    true
  }

  fn is_same_origin(&self, request: &Request) -> bool {
    request.url.origin() == self.origin.origin()
  }

  fn is_uncacheable(&self, request: &Request) -> bool {
    request.method != reqwest::Method::GET || !matches!(request.url.scheme(), "http" | "https")
  }

  /// Hosts whose first label is `api` (not merely containing `api.`
  /// somewhere), configured API hosts, and `/api` paths.
  fn is_api(&self, request: &Request) -> bool {
    let host = Self::host(request);
    let path = request.url.path();
    host.split('.').next() == Some("api")
      || self.api_hosts.contains(&host)
      || path == "/api"
      || path.starts_with("/api/")
  }

  fn is_cdn(&self, request: &Request) -> bool {
    self.cdn_hosts.contains(&Self::host(request))
  }

  fn is_static_asset(&self, request: &Request) -> bool {
    self.is_same_origin(request)
      && (request.destination.is_static_asset() || self.has_static_suffix(&request.url))
  }

  fn is_document(&self, request: &Request) -> bool {
    self.is_same_origin(request)
      && (request.is_document() || self.manifest_paths.contains(request.url.path()))
  }

  fn has_static_suffix(&self, url: &Url) -> bool {
    let file = url.path().rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        self.static_extensions.contains(&ext.to_lowercase())
      }
      _ => false,
    }
  }
}
