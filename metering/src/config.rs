//! Configuration for the metering worker

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ledger configuration
    #[serde(default)]
    pub ledger: token_ledger::Config,

    /// Metering configuration
    #[serde(default)]
    pub metering: MeteringConfig,
}

/// Metering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Length of one billable block
    pub block_interval_secs: u64,

    /// Seconds between scheduler passes
    pub tick_interval_secs: u64,

    /// Early-wake tolerance when deciding whether a block has elapsed
    #[serde(default = "default_tick_slack_ms")]
    pub tick_slack_ms: u64,
}

fn default_tick_slack_ms() -> u64 {
    500
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            block_interval_secs: 30,
            tick_interval_secs: 30,
            tick_slack_ms: default_tick_slack_ms(),
        }
    }
}

impl MeteringConfig {
    /// Block length
    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs)
    }

    /// Scheduler pass interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Tick slack
    pub fn tick_slack(&self) -> Duration {
        Duration::from_millis(self.tick_slack_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.block_interval_secs == 0 || self.tick_interval_secs == 0 {
            return Err(crate::Error::Config(
                "metering intervals must be positive".to_string(),
            ));
        }
        if self.tick_slack() >= self.block_interval() {
            return Err(crate::Error::Config(
                "tick slack must be shorter than a block".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.metering.validate()?;
        Ok(config)
    }

    /// Load defaults, overridden by environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment overrides in place
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.ledger.apply_env()?;

        if let Ok(value) = std::env::var("METERING_BLOCK_INTERVAL_SECS") {
            self.metering.block_interval_secs = parse_env("METERING_BLOCK_INTERVAL_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("METERING_TICK_INTERVAL_SECS") {
            self.metering.tick_interval_secs = parse_env("METERING_TICK_INTERVAL_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("METERING_TICK_SLACK_MS") {
            self.metering.tick_slack_ms = parse_env("METERING_TICK_SLACK_MS", &value)?;
        }

        self.metering.validate()
    }
}

fn parse_env(name: &str, value: &str) -> crate::Result<u64> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.metering.block_interval(), Duration::from_secs(30));
        assert_eq!(config.metering.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.metering.tick_slack(), Duration::from_millis(500));
        assert_eq!(config.ledger.service_name, "token-ledger");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            r#"
[metering]
block_interval_secs = 60
tick_interval_secs = 10
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.metering.block_interval_secs, 60);
        assert_eq!(config.metering.tick_interval_secs, 10);
        assert_eq!(config.metering.tick_slack_ms, 500);
        assert_eq!(config.ledger.ledger.lock_timeout_ms, 3_000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "[metering]\nblock_interval_secs = 0\ntick_interval_secs = 30\n",
        )
        .unwrap();

        assert!(matches!(
            Config::from_file(&path),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_slack_must_be_shorter_than_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "[metering]\nblock_interval_secs = 1\ntick_interval_secs = 1\ntick_slack_ms = 1000\n",
        )
        .unwrap();

        assert!(matches!(
            Config::from_file(&path),
            Err(crate::Error::Config(_))
        ));
    }
}
