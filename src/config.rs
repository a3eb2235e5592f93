use std::str::FromStr;

use thiserror::Error;

use crate::service::{DEFAULT_PASSWORD_ITERATIONS, DEFAULT_PASSWORD_MEMORY_KIB};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Mount the unauthenticated `/admin` operator routes
    pub admin_routes: bool,
    pub log_format: LogFormat,
    pub node: NodeConfig,
    pub passwords: PasswordConfig,
    /// Start with the availability gate closed
    pub start_unavailable: bool,
    pub tokens: TokenConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct PasswordConfig {
    pub iterations: u32,
    pub memory_kib: u32,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub cleanup_interval_seconds: u64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Gcp,
    Json,
    #[default]
    Plain,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_PASSWORD_ITERATIONS,
            memory_kib: DEFAULT_PASSWORD_MEMORY_KIB,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 60,
            ttl_seconds: 3600, // 1 hour
        }
    }
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "gcp" => LogFormat::Gcp,
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = (
            NodeConfig::default(),
            PasswordConfig::default(),
            TokenConfig::default(),
        );

        let config = Config {
            admin_routes: flag(&lookup, "ENABLE_ADMIN_ROUTES"),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            node: NodeConfig {
                bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.0.bind_address),
                data_dir: lookup("DATA_DIR").unwrap_or(defaults.0.data_dir),
            },
            passwords: PasswordConfig {
                iterations: parse_var(&lookup, "PASSWORD_HASH_ITERATIONS", defaults.1.iterations)?,
                memory_kib: parse_var(&lookup, "PASSWORD_HASH_MEMORY_KIB", defaults.1.memory_kib)?,
            },
            start_unavailable: flag(&lookup, "START_UNAVAILABLE"),
            tokens: TokenConfig {
                cleanup_interval_seconds: parse_var(
                    &lookup,
                    "TOKEN_CLEANUP_INTERVAL_SECONDS",
                    defaults.2.cleanup_interval_seconds,
                )?,
                ttl_seconds: parse_var(&lookup, "TOKEN_TTL_SECONDS", defaults.2.ttl_seconds)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.bind_address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "BIND_ADDRESS cannot be empty".to_string(),
            ));
        }
        if self.node.data_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_DIR cannot be empty".to_string(),
            ));
        }
        if self.tokens.ttl_seconds == 0 || self.tokens.ttl_seconds > i64::MAX as u64 {
            return Err(ConfigError::ValidationError(
                "TOKEN_TTL_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.tokens.cleanup_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "TOKEN_CLEANUP_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.passwords.iterations == 0 {
            return Err(ConfigError::ValidationError(
                "PASSWORD_HASH_ITERATIONS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).is_some_and(|v| v == "true" || v == "1")
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::ValidationError(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.node.bind_address, "0.0.0.0:8080");
        assert_eq!(config.node.data_dir, "./data");
        assert_eq!(config.tokens.ttl_seconds, 3600);
        assert_eq!(config.tokens.cleanup_interval_seconds, 60);
        assert_eq!(config.passwords.memory_kib, 19456);
        assert_eq!(config.passwords.iterations, 2);
        assert!(!config.start_unavailable);
        assert!(!config.admin_routes);
        assert_eq!(config.log_format, LogFormat::Plain);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BIND_ADDRESS", "127.0.0.1:9000"),
            ("ENABLE_ADMIN_ROUTES", "1"),
            ("LOG_FORMAT", "JSON"),
            ("START_UNAVAILABLE", "true"),
            ("TOKEN_TTL_SECONDS", "60"),
        ])
        .unwrap();
        assert_eq!(config.node.bind_address, "127.0.0.1:9000");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.start_unavailable);
        assert!(config.admin_routes);
        assert_eq!(config.tokens.ttl_seconds, 60);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = load(&[("TOKEN_TTL_SECONDS", "0")]).unwrap_err();
        assert!(err.to_string().contains("TOKEN_TTL_SECONDS"));
    }

    #[test]
    fn test_rejects_unparseable_numbers() {
        assert!(load(&[("TOKEN_CLEANUP_INTERVAL_SECONDS", "soon")]).is_err());
        assert!(load(&[("PASSWORD_HASH_MEMORY_KIB", "-1")]).is_err());
    }
}
