//! Network side of the interception layer: request/response types and the
//! fetcher that actually talks to origins.

mod client;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Credentials, Destination, Request, Response};
