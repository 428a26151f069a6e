//! Process configuration from the environment

use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidEnvVar { key: &'static str, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Without a database the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
}

impl AppConfig {
    /// Reads `HOST`, `PORT`, `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and `NATS_URL`,
    /// after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed("PORT", var("PORT"), 8083)?,
            database_url: var("DATABASE_URL"),
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", var("DATABASE_MAX_CONNECTIONS"), 10)?,
            nats_url: var("NATS_URL"),
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidEnvVar { key: "HOST", message: e.to_string() })
    }
}

fn parsed<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidEnvVar { key, message: format!("'{raw}': {e}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.port, 8083);
        assert_eq!(c.database_max_connections, 10);
        assert!(c.database_url.is_none());
        assert!(c.nats_url.is_none());
        assert_eq!(c.listen_addr().unwrap().port(), 8083);
    }

    #[test]
    fn test_overrides() {
        let c = config(&[("PORT", "9000"), ("DATABASE_URL", "postgres://localhost/shop"), ("NATS_URL", " "), ("HOST", "127.0.0.1")]).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.database_url.as_deref(), Some("postgres://localhost/shop"));
        assert!(c.nats_url.is_none());
        assert_eq!(c.listen_addr().unwrap().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_port() {
        let err = config(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { key: "PORT", .. }));
    }
}
