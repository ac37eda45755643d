use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::SqliteStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

/// Location of the remote receipt collection.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// API base URL (e.g., "https://cloud.example.com/v1")
  pub endpoint: String,
  pub project: String,
  pub database: String,
  pub collection: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Cache database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl CacheConfig {
  pub fn resolve_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(p) => Ok(p.clone()),
      None => {
        SqliteStorage::default_path().ok_or_else(|| eyre!("Could not determine data directory"))
      }
    }
  }
}

/// Tuning for pagination, rate-limit handling and freshness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub page_size: usize,
  /// Pause between successful pages
  #[serde(deserialize_with = "deserialize_millis")]
  pub page_delay: Duration,
  #[serde(flatten)]
  pub retry: RetryPolicy,
  /// Cached aggregates older than this trigger a delta pass
  #[serde(deserialize_with = "deserialize_secs")]
  pub staleness_window: Duration,
  /// Slack subtracted from the watermark in delta queries
  #[serde(deserialize_with = "deserialize_millis")]
  pub delta_buffer: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      page_size: 100,
      page_delay: Duration::from_millis(100),
      retry: RetryPolicy::default(),
      staleness_window: Duration::from_secs(60 * 60),
      delta_buffer: Duration::from_secs(1),
    }
  }
}

/// Bounded exponential backoff for rate-limited page requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Attempts per page, including the first
  pub max_attempts: u32,
  #[serde(deserialize_with = "deserialize_millis")]
  pub initial_backoff: Duration,
  #[serde(deserialize_with = "deserialize_millis")]
  pub max_backoff: Duration,
  pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff: Duration::from_millis(2000),
      max_backoff: Duration::from_secs(30),
      backoff_multiplier: 2,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = self
      .backoff_multiplier
      .max(1)
      .saturating_pow(attempt.saturating_sub(1));
    self
      .initial_backoff
      .saturating_mul(factor)
      .min(self.max_backoff)
  }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./receipt-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/receipt-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/receipt-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("receipt-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("receipt-sync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks RECEIPT_SYNC_API_KEY first, then APPWRITE_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("RECEIPT_SYNC_API_KEY")
      .or_else(|_| std::env::var("APPWRITE_API_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set RECEIPT_SYNC_API_KEY or APPWRITE_API_KEY environment variable.")
      })
  }
}
