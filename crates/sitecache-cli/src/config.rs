//! Command line configuration.
//!
//! Stored at `~/.config/sitecache/config.json`. `SITECACHE_API_URL` and
//! `SITECACHE_TOKEN` (from the environment or a `.env` file) take precedence
//! over the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sitecache_core::SyncConfig;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sitecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "SITECACHE_API_URL";
const ENV_TOKEN: &str = "SITECACHE_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub token: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `SITECACHE_API_URL` / `SITECACHE_TOKEN` when set.
    pub fn with_env(self) -> Self {
        self.with_overrides(std::env::var(ENV_API_URL).ok(), std::env::var(ENV_TOKEN).ok())
    }

    fn with_overrides(mut self, api_url: Option<String>, token: Option<String>) -> Self {
        if let Some(url) = api_url.filter(|u| !u.is_empty()) {
            self.api_base_url = Some(url);
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
        self
    }

    pub fn api_url(&self) -> Result<&str> {
        self.api_base_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No API URL configured. Set {} or run `sitecache config --api-url <URL>`",
                ENV_API_URL
            )
        })
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_file_values() {
        let config = Config {
            api_base_url: Some("https://old.example.com/".to_string()),
            token: None,
            sync: SyncConfig::default(),
        };

        let config = config.with_overrides(
            Some("https://api.example.com/v1/".to_string()),
            Some("secret".to_string()),
        );
        assert_eq!(config.api_url().unwrap(), "https://api.example.com/v1/");
        assert_eq!(config.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_empty_overrides_are_ignored() {
        let config = Config {
            api_base_url: Some("https://api.example.com/".to_string()),
            ..Default::default()
        };

        let config = config.with_overrides(Some(String::new()), None);
        assert_eq!(config.api_url().unwrap(), "https://api.example.com/");
    }

    #[test]
    fn test_missing_url_is_an_error() {
        assert!(Config::default().api_url().is_err());
    }

    #[test]
    fn test_partial_file_uses_sync_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://api.example.com/"}"#).unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        assert!(config.token.is_none());
    }
}
