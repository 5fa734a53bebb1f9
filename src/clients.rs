//! Host-side collaborators: the client windows this layer serves and the
//! notification surface.
//!
//! The core only talks to these traits. The console implementations back
//! the CLI, where there is a single pseudo-client and notifications are
//! printed as JSON lines.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::io::Write;
use tracing::info;
use url::Url;

/// A window (or other context) of the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: String,
  pub url: Url,
}

/// Connected clients of the hosting application.
#[async_trait]
pub trait Clients: Send + Sync {
  /// Take control of clients that are already open.
  async fn claim(&self) -> Result<()>;

  async fn list(&self) -> Result<Vec<Client>>;

  async fn post_message(&self, client: &Client, message: &serde_json::Value) -> Result<()>;

  async fn focus(&self, client: &Client) -> Result<()>;

  async fn open_window(&self, url: &Url) -> Result<()>;
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub actions: Vec<NotificationAction>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<()>;
}

fn print_json(value: &impl Serialize) -> Result<()> {
  let line = serde_json::to_string(value).map_err(|e| eyre!("Failed to encode message: {}", e))?;
  let mut stdout = std::io::stdout().lock();
  writeln!(stdout, "{}", line).map_err(|e| eyre!("Failed to write to stdout: {}", e))?;
  Ok(())
}

/// The terminal as the only client.
pub struct ConsoleClients {
  client: Client,
}

impl ConsoleClients {
  pub fn new(app_url: Url) -> Self {
    Self {
      client: Client {
        id: "console".to_string(),
        url: app_url,
      },
    }
  }
}

#[async_trait]
impl Clients for ConsoleClients {
  async fn claim(&self) -> Result<()> {
    info!(client = %self.client.id, "claimed clients");
    Ok(())
  }

  async fn list(&self) -> Result<Vec<Client>> {
    Ok(vec![self.client.clone()])
  }

  async fn post_message(&self, _client: &Client, message: &serde_json::Value) -> Result<()> {
    print_json(message)
  }

  async fn focus(&self, client: &Client) -> Result<()> {
    info!(client = %client.id, url = %client.url, "focus window");
    Ok(())
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    info!(url = %url, "open window");
    Ok(())
  }
}

/// Prints notifications instead of displaying them.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    print_json(notification)
  }
}
