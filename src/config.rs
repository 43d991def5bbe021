use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tally::EngineConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  /// User id whose rows are mirrored
  pub owner: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend (e.g. "https://xyz.supabase.co")
  pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_secs: u64,
  pub retention_secs: u64,
  pub settle_ms: u64,
  pub poll_secs: u64,
  pub sweep_secs: u64,
  /// Keep a snapshot of every scope on disk for offline cold starts
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_secs: 30,
      retention_secs: 300,
      settle_ms: 250,
      poll_secs: 30,
      sweep_secs: 60,
      persist: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tally.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tally/config.yaml
  ///
  /// Without a file the defaults are used; only `--memory` runs work then.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tally.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tally").join("config.yaml");
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
    serde_yaml::from_str(contents)
  }

  pub fn engine_config(&self) -> EngineConfig {
    EngineConfig::default()
      .with_stale_window(Duration::from_secs(self.cache.stale_secs))
      .with_retention(Duration::from_secs(self.cache.retention_secs))
      .with_settle_delay(Duration::from_millis(self.cache.settle_ms))
      .with_poll_interval(Duration::from_secs(self.cache.poll_secs))
      .with_sweep_interval(Duration::from_secs(self.cache.sweep_secs.max(1)))
  }

  pub fn backend_url(&self) -> Result<&str> {
    self
      .backend
      .url
      .as_deref()
      .ok_or_else(|| eyre!("No backend.url configured. Set it in tally.yaml or run with --memory."))
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks TALLY_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("TALLY_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| eyre!("API key not found. Set TALLY_API_KEY or SUPABASE_ANON_KEY environment variable."))
  }

  /// Signed-in user's access token, if TALLY_ACCESS_TOKEN is set.
  pub fn get_access_token() -> Option<String> {
    std::env::var("TALLY_ACCESS_TOKEN").ok().filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_missing_sections() {
    let config = Config::parse("owner: u1\nbackend:\n  url: https://example.supabase.co\n").unwrap();
    assert_eq!(config.owner.as_deref(), Some("u1"));
    assert_eq!(config.cache.stale_secs, 30);
    assert!(config.cache.persist);
    assert_eq!(config.log.filter, "info");
    assert_eq!(config.engine_config(), EngineConfig::default());
  }

  #[test]
  fn test_cache_overrides() {
    let config = Config::parse("cache:\n  stale_secs: 5\n  persist: false\n").unwrap();
    let engine = config.engine_config();
    assert_eq!(engine.stale_window, Duration::from_secs(5));
    assert_eq!(engine.retention, Duration::from_secs(300));
    assert!(!config.cache.persist);
    assert!(config.backend_url().is_err());
  }
}
