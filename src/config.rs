use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Environment variable that overrides `app.cache_version`.
const CACHE_VERSION_ENV: &str = "OFFGRID_CACHE_VERSION";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub app: AppConfig,
  /// Paths (relative to the origin) pre-populated into the static store
  #[serde(default = "default_assets")]
  pub assets: Vec<String>,
  /// Absolute third-party URLs pre-populated into the cdn store
  #[serde(default)]
  pub external_resources: Vec<String>,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub wellness: WellnessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Prefix shared by every store this application owns (e.g. "breathe")
  pub namespace: String,
  /// Current generation, must start with "{namespace}-" (e.g. "breathe-v3")
  pub cache_version: String,
  /// Origin the application is served from
  #[serde(deserialize_with = "deserialize_origin")]
  pub origin: Url,
  /// Path under which client windows of the application live
  #[serde(default = "default_base_path")]
  pub base_path: String,
  /// Document served when a page is requested offline and not cached
  #[serde(default = "default_fallback_document")]
  pub fallback_document: String,
  /// Human-readable name used as the default notification title
  pub display_name: Option<String>,
}

impl AppConfig {
  pub fn display_name(&self) -> &str {
    self.display_name.as_deref().unwrap_or(&self.namespace)
  }
}

fn deserialize_origin<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Url::parse(&s).map_err(serde::de::Error::custom)
}

fn default_assets() -> Vec<String> {
  vec!["/".into(), "/index.html".into(), "/manifest.json".into()]
}

fn default_base_path() -> String {
  "/".into()
}

fn default_fallback_document() -> String {
  "/index.html".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Third-party content hosts served store-preferred from the cdn store
  pub cdn_hosts: Vec<String>,
  /// Extra hosts treated as API endpoints
  pub api_hosts: Vec<String>,
  /// File suffixes (without the dot) that mark a same-origin static asset
  pub static_extensions: Vec<String>,
  /// Well-known web app manifest paths
  pub manifest_paths: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      cdn_hosts: strings(&[
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "cdnjs.cloudflare.com",
        "cdn.jsdelivr.net",
        "unpkg.com",
      ]),
      api_hosts: Vec::new(),
      static_extensions: strings(&[
        "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "woff",
        "woff2", "ttf", "otf", "eot",
      ]),
      manifest_paths: strings(&[
        "/manifest.json",
        "/manifest.webmanifest",
        "/site.webmanifest",
      ]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Upper bound on a single fetch, including the body
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 15,
      user_agent: concat!("offgrid/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/offgrid/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; RUST_LOG takes precedence
  pub level: String,
  /// Also write daily-rotated log files
  pub file: bool,
  /// Log directory (default: $XDG_DATA_HOME/offgrid/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".into(),
      file: false,
      directory: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WellnessConfig {
  pub interval_secs: u64,
}

impl Default for WellnessConfig {
  fn default() -> Self {
    Self { interval_secs: 300 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/offgrid/config.yaml\n\
                 See config.example.yaml for the format."
        ))
      }
    };

    if let Ok(version) = std::env::var(CACHE_VERSION_ENV) {
      config.app.cache_version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Check the invariants the rest of the crate relies on.
  pub fn validate(&self) -> Result<()> {
    let app = &self.app;

    if app.namespace.is_empty() {
      return Err(eyre!("app.namespace must not be empty"));
    }

    let prefix = format!("{}-", app.namespace);
    if !app.cache_version.starts_with(&prefix) || app.cache_version.len() == prefix.len() {
      return Err(eyre!(
        "app.cache_version '{}' must start with '{}' followed by a version",
        app.cache_version,
        prefix
      ));
    }

    if !matches!(app.origin.scheme(), "http" | "https") {
      return Err(eyre!("app.origin must be an http(s) URL, got {}", app.origin));
    }

    if !app.base_path.starts_with('/') {
      return Err(eyre!("app.base_path must start with '/'"));
    }

    if self.network.timeout_secs == 0 {
      return Err(eyre!("network.timeout_secs must be at least 1"));
    }

    Ok(())
  }

  /// Resolve a configured path against the application origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .app
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
  }

  #[cfg(test)]
  pub fn sample() -> Self {
    let config = Self::from_yaml(
      r#"
app:
  namespace: breathe
  cache_version: breathe-v2
  origin: https://breathe.example.com
  display_name: Breathe
assets:
  - /
  - /index.html
  - /app.js
  - /styles.css
external_resources:
  - https://fonts.googleapis.com/css2?family=Inter
  - https://cdnjs.cloudflare.com/ajax/libs/lodash/4.17.21/lodash.min.js
"#,
    )
    .expect("sample config parses");
    config.validate().expect("sample config is valid");
    config
  }
}
