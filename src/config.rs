use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Remote backend the engine reconciles against. Required by the CLI;
  /// embedded users may inject their own `RemoteStore` instead.
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the row-scoped REST backend.
  pub url: String,
  /// Owner scope applied to every mutation.
  pub user_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (default: platform data dir).
  pub path: Option<PathBuf>,
  /// Soft capacity for the persistent store, in bytes.
  pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Seconds between periodic drain attempts.
  pub interval_secs: u64,
  /// Attempts per entry before it moves to the failed bucket.
  pub max_retries: u32,
  /// Attempts per background task before it is dropped.
  pub background_max_retries: u32,
  /// Base for the in-pass backoff delay (`base * attempt`).
  pub retry_base_delay_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      max_retries: 3,
      background_max_retries: 5,
      retry_base_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Quiet period a non-immediate cache write waits for.
  pub debounce_ms: u64,
  /// How long memoized values stay fresh.
  pub ttl_ms: u64,
  /// How often due debounced writes are flushed.
  pub flush_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 500,
      ttl_ms: 60_000,
      flush_interval_ms: 250,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./syncline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/syncline/config.yaml
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
        "No configuration file found. Create one at ~/.config/syncline/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("syncline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("syncline").join("config.yaml");
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

  /// Get the remote API token from the environment.
  pub fn get_api_token() -> Result<String> {
    std::env::var("SYNCLINE_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the SYNCLINE_API_TOKEN environment variable."))
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs)
  }

  pub fn retry_base_delay(&self) -> Duration {
    Duration::from_millis(self.sync.retry_base_delay_ms)
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.cache.debounce_ms)
  }

  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.cache.ttl_ms)
  }

  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.cache.flush_interval_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();

    assert_eq!(config.sync.interval_secs, 30);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.background_max_retries, 5);
    assert_eq!(config.cache.debounce_ms, 500);
    assert_eq!(config.cache.ttl_ms, 60_000);
    assert!(config.remote.is_none());
  }

  #[test]
  fn test_parse_partial_yaml_fills_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
remote:
  url: https://api.example.com/v1
  user_id: u-123
sync:
  max_retries: 5
"#,
    )
    .unwrap();

    let remote = config.remote.unwrap();
    assert_eq!(remote.url, "https://api.example.com/v1");
    assert_eq!(remote.user_id, "u-123");
    assert_eq!(config.sync.max_retries, 5);
    // Untouched fields keep their defaults
    assert_eq!(config.sync.interval_secs, 30);
    assert_eq!(config.cache.flush_interval_ms, 250);
  }

  #[test]
  fn test_duration_helpers() {
    let config = Config::default();

    assert_eq!(config.sync_interval(), Duration::from_secs(30));
    assert_eq!(config.retry_base_delay(), Duration::from_millis(1000));
    assert_eq!(config.debounce(), Duration::from_millis(500));
  }
}
