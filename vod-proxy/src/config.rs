use crate::errors::ProxyError;
use crate::keys::OriginKey;
use crate::strategy::Strategy;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Per-attempt upstream timeout in milliseconds; absent or 0 disables it
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Address the local endpoint binds to when it is first needed
    #[serde(default)]
    pub listener: Listener,
    /// Origins governed by the proxy
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    /// Checks every strategy url with the same rules `Proxy::set_strategy` applies
    pub fn validate(&self) -> Result<(), ConfigError> {
        for strategy in &self.strategies {
            strategy
                .parse()
                .map_err(|source| ConfigError::InvalidStrategy {
                    origin: strategy.origin.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Local endpoint bind address
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

/// Failover strategy for one origin
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StrategyConfig {
    /// Origin base, e.g. `https://example-qcdn.com`
    pub origin: String,
    /// Origin base used when the primary fails
    pub backup: String,
    /// First-bytes origin; accepted but not used for routing
    pub boot: Option<String>,
}

impl StrategyConfig {
    pub fn parse(&self) -> Result<(OriginKey, Strategy), ProxyError> {
        let origin = OriginKey::parse(&self.origin)?;
        let strategy = Strategy::parse(&self.backup, self.boot.as_deref())?;
        Ok((origin, strategy))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid strategy for {origin}: {source}")]
    InvalidStrategy { origin: String, source: ProxyError },
}
