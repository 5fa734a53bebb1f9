//! Messages exchanged with the hosting application: control commands in,
//! wellness pings out, push payloads turned into notifications, and
//! notification clicks turned into window focus.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Clients, Notification, NotificationAction, Notifier};
use crate::error::CacheError;

/// Commands the hosting application can send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Stop waiting and activate the installed generation now
  SkipWaiting,
  /// Delete every store
  ClearCache,
}

impl ControlMessage {
  /// Parse a raw message; anything unrecognized is logged and ignored.
  pub fn parse(raw: &str) -> Option<Self> {
    match serde_json::from_str(raw) {
      Ok(message) => Some(message),
      Err(e) => {
        warn!(error = %e, "ignoring unrecognized control message");
        None
      }
    }
  }
}

/// Periodic liveness notice posted to every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WellnessMessage {
  #[serde(rename = "type")]
  pub kind: &'static str,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

impl WellnessMessage {
  pub fn now() -> Self {
    Self {
      kind: "WELLNESS_CHECK",
      timestamp: Utc::now().timestamp_millis(),
    }
  }
}

/// Post a wellness message to every client. Returns how many received it.
/// Failures are logged, never retried.
pub async fn broadcast_wellness(clients: &dyn Clients) -> usize {
  let message = match serde_json::to_value(WellnessMessage::now()) {
    Ok(v) => v,
    Err(e) => {
      warn!(error = %e, "failed to encode wellness message");
      return 0;
    }
  };

  let targets = match clients.list().await {
    Ok(targets) => targets,
    Err(e) => {
      warn!(error = %e, "failed to enumerate clients for wellness check");
      return 0;
    }
  };

  let mut delivered = 0;
  for client in &targets {
    match clients.post_message(client, &message).await {
      Ok(()) => delivered += 1,
      Err(e) => warn!(client = %client.id, error = %e, "wellness check not delivered"),
    }
  }
  debug!(delivered, total = targets.len(), "wellness check sent");
  delivered
}

/// Broadcast wellness messages forever on a fixed interval.
pub async fn run_wellness(clients: &dyn Clients, every: Duration) {
  let mut ticker = tokio::time::interval(every);
  loop {
    ticker.tick().await;
    broadcast_wellness(clients).await;
  }
}

/// Body of a push message. Both fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
}

const DEFAULT_PUSH_BODY: &str = "You have a new reminder.";

/// Build the notification for a push payload.
pub fn notification_for_push(raw: &[u8], app_name: &str) -> Result<Notification, CacheError> {
  let payload: PushPayload =
    serde_json::from_slice(raw).map_err(|e| CacheError::MalformedPayload(e.to_string()))?;

  Ok(Notification {
    title: payload.title.unwrap_or_else(|| app_name.to_string()),
    body: payload
      .body
      .unwrap_or_else(|| DEFAULT_PUSH_BODY.to_string()),
    actions: vec![
      NotificationAction {
        action: "open".into(),
        title: "Open".into(),
      },
      NotificationAction {
        action: "close".into(),
        title: "Close".into(),
      },
    ],
  })
}

/// Handle a push: show a notification, or log why none was shown.
/// Returns whether a notification was displayed.
pub async fn handle_push(notifier: &dyn Notifier, raw: &[u8], app_name: &str) -> bool {
  let notification = match notification_for_push(raw, app_name) {
    Ok(n) => n,
    Err(e) => {
      warn!(error = %e, "push ignored");
      return false;
    }
  };

  match notifier.show(&notification).await {
    Ok(()) => {
      info!(title = %notification.title, "notification shown");
      true
    }
    Err(e) => {
      warn!(error = %e, "failed to show notification");
      false
    }
  }
}

/// Handle a notification click. `open` or a click on the body focuses a
/// client under `app_url`'s path (or opens one); `close` only dismisses.
pub async fn handle_notification_click(clients: &dyn Clients, action: Option<&str>, app_url: &Url) {
  if action == Some("close") {
    debug!("notification dismissed");
    return;
  }

  let existing = match clients.list().await {
    Ok(list) => list.into_iter().find(|c| {
      c.url.origin() == app_url.origin() && c.url.path().starts_with(app_url.path())
    }),
    Err(e) => {
      warn!(error = %e, "failed to enumerate clients");
      None
    }
  };

  let outcome = match existing {
    Some(client) => clients.focus(&client).await,
    None => clients.open_window(app_url).await,
  };
  if let Err(e) = outcome {
    warn!(error = %e, "failed to bring application to front");
  }
}
