use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use sensordash::api::keys::Freshness;
use sensordash::api::DashboardSettings;

/// Environment variable that overrides `backend.url`.
pub const BACKEND_URL_ENV: &str = "SENSORDASH_BACKEND_URL";
/// Environment variable read by `login` when no password argument is given.
pub const PASSWORD_ENV: &str = "SENSORDASH_PASSWORD";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub notes: NotesConfig,
  #[serde(default)]
  pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the dashboard backend, e.g. "https://sensors.example.org"
  pub url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Per-entity freshness overrides in seconds, keyed by entity type
  /// (e.g. "get-incidents: 10").
  #[serde(default)]
  pub stale_secs: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotesConfig {
  /// Accept new notes on incidents that are already closed.
  #[serde(default)]
  pub allow_on_closed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
  /// Location of the credential database (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sensordash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sensordash/config.yaml
  ///
  /// With no file at all, defaults are used as long as the backend URL comes
  /// from the environment.
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

    let env_url = std::env::var(BACKEND_URL_ENV).ok();
    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None if env_url.is_some() => Config::default(),
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/sensordash/config.yaml\n\
                 or set {}.",
          BACKEND_URL_ENV
        ))
      }
    };

    Ok(config.with_backend_override(env_url))
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sensordash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sensordash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty document deserializes to null rather than an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  fn with_backend_override(mut self, url: Option<String>) -> Self {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
      self.backend.url = Some(url);
    }
    self
  }

  pub fn backend_url(&self) -> Result<Url> {
    let raw = self
      .backend
      .url
      .as_deref()
      .ok_or_else(|| eyre!("backend.url is not set. Add it to the config or set {}.", BACKEND_URL_ENV))?;

    Url::parse(raw).map_err(|e| eyre!("Invalid backend url {:?}: {}", raw, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.backend.timeout_secs)
  }

  pub fn dashboard_settings(&self) -> DashboardSettings {
    DashboardSettings {
      freshness: Freshness::new(self.cache.stale_secs.clone()),
      allow_notes_on_closed: self.notes.allow_on_closed,
    }
  }

  /// Get the login password from environment variables.
  ///
  /// Checks SENSORDASH_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var(PASSWORD_ENV)
      .map_err(|_| eyre!("Password not found. Pass --password or set {}.", PASSWORD_ENV))
  }
}
