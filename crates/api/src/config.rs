//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use tally_infra::command_dispatcher::DEFAULT_MAX_CONFLICT_RETRIES;
use tally_infra::gateway::DEFAULT_COMMAND_TIMEOUT;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("missing required variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub command_timeout: Duration,
    pub conflict_retries: u32,
    #[cfg(feature = "postgres")]
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            #[cfg(feature = "postgres")]
            database_url: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(raw) = lookup("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", &raw)?;
        }
        if let Some(raw) = lookup("COMMAND_TIMEOUT_MS") {
            config.command_timeout = Duration::from_millis(parse("COMMAND_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("CONFLICT_RETRIES") {
            config.conflict_retries = parse("CONFLICT_RETRIES", &raw)?;
        }
        #[cfg(feature = "postgres")]
        {
            config.database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap(), Config::default());
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("COMMAND_TIMEOUT_MS", "250"),
            ("CONFLICT_RETRIES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.conflict_retries, 0);
    }

    #[test]
    fn garbage_is_rejected_with_the_key() {
        let err = Config::from_lookup(lookup(&[("COMMAND_TIMEOUT_MS", "soon"), ("DATABASE_URL", "postgres://x")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "COMMAND_TIMEOUT_MS",
                value: "soon".to_string()
            }
        );
    }
}
