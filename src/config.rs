use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Customs office to scope transit queries to by default.
  pub default_aduana: Option<String>,
  #[serde(default)]
  pub poll: PollConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Push topic carrying transit updates.
  #[serde(default = "default_transit_topic")]
  pub transit_topic: String,
}

fn default_transit_topic() -> String {
  "transits".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
  #[serde(default = "default_transits_secs")]
  pub transits_secs: u64,
  #[serde(default = "default_stock_secs")]
  pub stock_secs: u64,
  #[serde(default = "default_trucks_secs")]
  pub trucks_secs: u64,
}

fn default_transits_secs() -> u64 {
  30
}

fn default_stock_secs() -> u64 {
  120
}

fn default_trucks_secs() -> u64 {
  15
}

impl Default for PollConfig {
  fn default() -> Self {
    Self {
      transits_secs: default_transits_secs(),
      stock_secs: default_stock_secs(),
      trucks_secs: default_trucks_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Explicit database path; defaults to the XDG data directory.
  pub path: Option<PathBuf>,
}

fn default_ttl_secs() -> u64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      path: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./garita.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/garita/config.yaml
  /// 4. ~/.config/garita/config.yaml
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
        "No configuration file found. Create one at ~/.config/garita/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("garita.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("garita").join("config.yaml");
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
  /// Checks GARITA_API_TOKEN first, then GARITA_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("GARITA_API_TOKEN")
      .or_else(|_| std::env::var("GARITA_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set GARITA_API_TOKEN or GARITA_TOKEN environment variable.")
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
api:
  url: https://tracking.example.com/v1/
default_aduana: ASU
"#,
    )
    .unwrap();

    assert_eq!(config.api.transit_topic, "transits");
    assert_eq!(config.poll.transits_secs, 30);
    assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    assert_eq!(config.default_aduana.as_deref(), Some("ASU"));
  }
}
