//! Request and response types shared by the router, strategies and storage.

use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Declared resource type of an outbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
  #[default]
  Other,
}

impl Destination {
  /// Sub-resources that are safe to serve from the store without revalidation.
  pub fn is_static_asset(self) -> bool {
    matches!(
      self,
      Destination::Image | Destination::Font | Destination::Style | Destination::Script
    )
  }
}

/// Whether ambient credentials travel with the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Credentials {
  #[default]
  SameOrigin,
  Omit,
}

/// Headers that carry credentials and are stripped for `Credentials::Omit`.
const CREDENTIAL_HEADERS: &[&str] = &["cookie", "authorization"];

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub credentials: Credentials,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A GET request with no extra headers.
  pub fn get(url: Url, destination: Destination) -> Self {
    Self {
      method: Method::GET,
      url,
      destination,
      credentials: Credentials::default(),
      headers: Vec::new(),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_credentials(mut self, credentials: Credentials) -> Self {
    self.credentials = credentials;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Headers that should actually leave the process.
  pub fn outgoing_headers(&self) -> impl Iterator<Item = &(String, String)> {
    let omit = self.credentials == Credentials::Omit;
    self.headers.iter().filter(move |(name, _)| {
      !(omit && CREDENTIAL_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
    })
  }

  pub fn is_document(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// A complete response held in memory.
///
/// The body is an immutable, reference-counted buffer, so handing the same
/// response to the caller and to the store needs no duplication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Only a plain `200 OK` is worth storing. Redirects are never followed
  /// by the fetcher, so they show up here as 3xx and are skipped.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }
}

fn reason_phrase(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
