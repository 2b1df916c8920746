use std::env;
use std::path::PathBuf;

use draw_core::DEFAULT_ATTEMPT_LIMIT;
use thiserror::Error;

pub const DEFAULT_ADMIN_PASSWORD: &str = "changeme";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub admin_password: String,
    pub persist_path: Option<PathBuf>,
    pub bind_addr: String,
    pub attempt_limit: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            persist_path: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
        }
    }
}

impl Config {
    /// Reads `ADMIN_PASSWORD`, `PERSIST_PATH`, `BIND_ADDR` and
    /// `DRAW_ATTEMPT_LIMIT`, falling back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let attempt_limit: usize = match lookup("DRAW_ATTEMPT_LIMIT") {
            Some(value) => match value.trim().parse() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "DRAW_ATTEMPT_LIMIT",
                        value,
                    })
                }
            },
            None => defaults.attempt_limit,
        };

        Ok(Self {
            admin_password: lookup("ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
            persist_path: lookup("PERSIST_PATH").map(PathBuf::from),
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            attempt_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.attempt_limit, 100);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ADMIN_PASSWORD", "s3cret"),
            ("PERSIST_PATH", "/tmp/exchanges.json"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DRAW_ATTEMPT_LIMIT", " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.admin_password, "s3cret");
        assert_eq!(config.persist_path, Some(PathBuf::from("/tmp/exchanges.json")));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.attempt_limit, 250);
    }

    #[test]
    fn rejects_bad_attempt_limit() {
        let err = Config::from_lookup(lookup(&[("DRAW_ATTEMPT_LIMIT", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                name: "DRAW_ATTEMPT_LIMIT",
                value: "lots".into()
            }
        );
    }

    #[test]
    fn rejects_zero_attempt_limit() {
        let err = Config::from_lookup(lookup(&[("DRAW_ATTEMPT_LIMIT", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                name: "DRAW_ATTEMPT_LIMIT",
                value: "0".into()
            }
        );
        assert!(err.to_string().contains("positive"));
    }
}
