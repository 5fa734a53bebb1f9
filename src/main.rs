mod cache;
mod clients;
mod config;
mod error;
mod lifecycle;
mod logging;
mod messages;
mod net;
mod router;
mod strategy;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use clients::{ConsoleClients, ConsoleNotifier};
use lifecycle::LifecycleController;
use messages::ControlMessage;
use net::{Destination, HttpFetcher, Request};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline-first caching layer for web application requests")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep stores in memory only, for this run
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create and pre-populate the current generation
  Install {
    /// Activate right after installing
    #[arg(long)]
    skip_waiting: bool,
  },
  /// Activate the current generation and delete older ones
  Activate,
  /// Send one request through the interception layer
  Fetch {
    url: Url,
    /// Declared resource type of the request
    #[arg(short, long, value_enum, default_value_t = Destination::Other)]
    dest: Destination,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Extra request header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Show what is stored for a URL, without touching the network
  Show {
    url: Url,
    #[arg(short, long, value_enum, default_value_t = Destination::Other)]
    dest: Destination,
  },
  /// List stores and their entry counts
  Stores,
  /// Delete every store
  Clear,
  /// Apply a JSON control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// Render a JSON push payload as a notification
  Push { json: String },
  /// Simulate a click on a notification
  Click {
    #[arg(long)]
    action: Option<String>,
  },
  /// Post wellness checks to clients
  Wellness {
    /// Send a single check and exit
    #[arg(long)]
    once: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let storage: Arc<dyn CacheStorage> = if args.ephemeral {
    Arc::new(MemoryStorage::new())
  } else {
    Arc::new(SqliteStorage::open(config.storage.path.as_deref())?)
  };
  let app_url = config.resolve(&config.app.base_path)?;
  let clients = Arc::new(ConsoleClients::new(app_url.clone()));
  let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
  let controller = LifecycleController::new(&config, storage.clone(), fetcher, clients.clone())?;

  match args.command {
    Command::Install { skip_waiting } => {
      if skip_waiting {
        controller.skip_waiting();
      }
      let report = controller.install().await?;
      print_json(&report)?;
      if skip_waiting {
        let pruned = controller.activate().await?;
        print_json(&serde_json::json!({ "pruned": pruned }))?;
      }
    }
    Command::Activate => {
      let pruned = controller.resume().await?;
      print_json(&serde_json::json!({ "pruned": pruned }))?;
    }
    Command::Fetch {
      url,
      dest,
      method,
      headers,
      output,
    } => {
      let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::get(url, dest).with_method(method);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      controller.resume().await?;
      let result = controller.handle(&request).await?;
      controller.flush().await;

      let response = result.data;
      eprintln!(
        "{} {} ({}, {})",
        response.status,
        response.status_text,
        result.source,
        response.header("content-type").unwrap_or("no content type")
      );
      match output {
        Some(path) => std::fs::write(&path, &response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&response.body)?,
      }
    }
    Command::Show { url, dest } => {
      let stored = controller.peek(&Request::get(url, dest))?;
      let response = &stored.response;
      println!("{} {}", response.status, response.status_text);
      println!("cached-at: {}", stored.cached_at.to_rfc3339());
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!("body: {} bytes", response.body.len());
    }
    Command::Stores => {
      for name in storage.store_names()? {
        let entries = storage.keys(&name)?.len();
        let marker = if controller.generations().is_stale(&name) {
          " (stale)"
        } else {
          ""
        };
        println!("{}\t{}{}", name, entries, marker);
      }
    }
    Command::Clear => {
      let report = controller.clear_all().await;
      print_json(&report)?;
      if !report.success {
        return Err(eyre!("Clearing caches failed"));
      }
    }
    Command::Message { json } => {
      if let Some(message) = ControlMessage::parse(&json) {
        let wants_activation = message == ControlMessage::SkipWaiting;
        if let Some(reply) = controller.handle_message(message).await {
          print_json(&reply)?;
        }
        if wants_activation {
          controller.resume().await?;
        }
      }
    }
    Command::Push { json } => {
      messages::handle_push(&ConsoleNotifier, json.as_bytes(), config.app.display_name()).await;
    }
    Command::Click { action } => {
      messages::handle_notification_click(clients.as_ref(), action.as_deref(), &app_url).await;
    }
    Command::Wellness { once } => {
      if once {
        messages::broadcast_wellness(clients.as_ref()).await;
      } else {
        let every = Duration::from_secs(config.wellness.interval_secs.max(1));
        messages::run_wellness(clients.as_ref(), every).await;
      }
    }
  }

  Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
