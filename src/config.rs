use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CachePolicies;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub device: DeviceConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CachePolicies,
  #[serde(default)]
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the backend REST API
  pub url: String,
  /// Request timeout in seconds
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Reachability probe timeout in seconds
  #[serde(default = "default_probe_timeout")]
  pub probe_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
  10
}

fn default_probe_timeout() -> u64 {
  3
}

/// How this device identifies itself when registering push subscriptions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
  pub platform: String,
  pub name: String,
}

impl Default for DeviceConfig {
  fn default() -> Self {
    Self {
      platform: "desktop".to_string(),
      name: "unnamed-device".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Seconds between dispatcher ticks (connectivity probes)
  pub tick_interval_secs: u64,
  /// Seconds between timer-triggered drain cycles
  pub drain_interval_secs: u64,
  /// Actions taken per queue batch during a drain
  pub batch_size: usize,
  /// Transient failures beyond this count dead-letter an action
  pub max_retries: u32,
  /// Base backoff delay in seconds; doubles per retry
  pub retry_base_secs: u64,
  /// Backoff ceiling in seconds
  pub retry_cap_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tick_interval_secs: 30,
      drain_interval_secs: 300,
      batch_size: 25,
      max_retries: 5,
      retry_base_secs: 30,
      retry_cap_secs: 3600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Maximum entries kept in the notification history
  pub history_size: usize,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self { history_size: 50 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledgersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledgersync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ledgersync/config.yaml\n\
                 with at least a backend.url entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ledgersync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledgersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks LEDGERSYNC_API_TOKEN first, then BACKEND_API_TOKEN as fallback.
  pub fn api_token() -> Result<String> {
    std::env::var("LEDGERSYNC_API_TOKEN")
      .or_else(|_| std::env::var("BACKEND_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Backend API token not found. Set LEDGERSYNC_API_TOKEN or BACKEND_API_TOKEN environment variable."
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
backend:
  url: https://api.example.com
"#,
    )
    .unwrap();

    assert_eq!(config.backend.url, "https://api.example.com");
    assert_eq!(config.backend.request_timeout_secs, 10);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.batch_size, 25);
    assert_eq!(config.notifications.history_size, 50);
    assert_eq!(config.cache.api.max_age_seconds, 3600);
  }

  #[test]
  fn test_overrides_are_respected() {
    let config: Config = serde_yaml::from_str(
      r#"
backend:
  url: https://api.example.com
  request_timeout_secs: 5
sync:
  batch_size: 3
  retry_base_secs: 1
cache:
  api:
    max_entries: 10
    max_age_seconds: 60
"#,
    )
    .unwrap();

    assert_eq!(config.backend.request_timeout_secs, 5);
    assert_eq!(config.sync.batch_size, 3);
    assert_eq!(config.sync.retry_base_secs, 1);
    assert_eq!(config.cache.api.max_entries, 10);
  }
}
