//! Configuration Management
//!
//! Handles persistent configuration storage for custodia.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Region used when nothing else names one
pub const DEFAULT_REGION: &str = "us-east-1";

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Account the run is attributed to
    #[serde(default)]
    pub account_id: Option<String>,
    /// Default region
    #[serde(default)]
    pub region: Option<String>,
    /// Provider gateway endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token for the gateway
    #[serde(default)]
    pub token: Option<String>,
    /// Persistent cache lifetime in minutes (0 disables)
    #[serde(default)]
    pub cache_period: Option<u64>,
    /// Persistent cache file
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

impl Config {
    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("custodia").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::warn!("failed to read config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Self {
        serde_json::from_str(content).unwrap_or_else(|e| {
            tracing::warn!("ignoring invalid config: {}", e);
            Self::default()
        })
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };

        // Create parent directory
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Get effective region (CLI > config > environment > default)
    pub fn effective_region(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.region.clone())
            .or_else(|| env_value(&["AWS_DEFAULT_REGION", "AWS_REGION"]))
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Get effective account (CLI > config > environment)
    pub fn effective_account(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.account_id.clone())
            .or_else(|| env_value(&["CUSTODIA_ACCOUNT_ID"]))
            .unwrap_or_default()
    }

    pub fn effective_endpoint(&self, cli: Option<&str>) -> Option<String> {
        cli.map(str::to_string).or_else(|| self.endpoint.clone())
    }

    pub fn effective_token(&self, cli: Option<&str>) -> Option<String> {
        cli.map(str::to_string)
            .or_else(|| self.token.clone())
            .or_else(|| env_value(&["CUSTODIA_TOKEN"]))
    }

    pub fn effective_cache_period(&self, cli: Option<u64>) -> u64 {
        cli.or(self.cache_period).unwrap_or(0)
    }
}

fn env_value(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_wins_over_config() {
        let config = Config {
            region: Some("eu-west-1".into()),
            account_id: Some("111".into()),
            cache_period: Some(15),
            ..Default::default()
        };
        assert_eq!(config.effective_region(Some("us-west-2")), "us-west-2");
        assert_eq!(config.effective_region(None), "eu-west-1");
        assert_eq!(config.effective_account(Some("222")), "222");
        assert_eq!(config.effective_account(None), "111");
        assert_eq!(config.effective_cache_period(None), 15);
        assert_eq!(config.effective_cache_period(Some(0)), 0);
    }

    #[test]
    fn test_parse_falls_back_to_default() {
        assert_eq!(Config::parse("not json"), Config::default());
        let config = Config::parse(r#"{"region": "ap-south-1", "cache_period": 5}"#);
        assert_eq!(config.region.as_deref(), Some("ap-south-1"));
        assert_eq!(config.cache_period, Some(5));
    }
}
