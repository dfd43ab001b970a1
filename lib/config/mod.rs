use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ServerId, NULL_SERVER_ID};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

pub struct Config {
    /// Identity of this space server; must be nonzero.
    pub server_id: ServerId,
    pub redis_url: String,
    /// Chain-store read endpoints; GETs round-robin across them.
    pub craq_get_addrs: Vec<String>,
    /// Chain-store write endpoint.
    pub craq_set_addr: String,
    /// Single byte prepended to every store key, namespacing this deployment.
    pub key_prefix: u8,
    /// Minimum wait before retrying an object the store reported missing.
    /// Default: 500ms
    pub not_found_sit_out: Duration,
    pub health_addr: String,
    /// Default: 10_000
    pub cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_id = env::var("OSEG_SERVER_ID")
            .map_err(|_| ConfigError::MissingEnvVar("OSEG_SERVER_ID".to_string()))?;
        let server_id: ServerId = server_id
            .parse()
            .map_err(|_| ConfigError::InvalidValue("OSEG_SERVER_ID", server_id.clone()))?;
        if server_id == NULL_SERVER_ID {
            return Err(ConfigError::InvalidValue(
                "OSEG_SERVER_ID",
                server_id.to_string(),
            ));
        }

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let craq_get_addrs = env::var("CRAQ_GET_ADDRS")
            .unwrap_or_else(|_| "127.0.0.1:10498".to_string())
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect::<Vec<_>>();
        if craq_get_addrs.is_empty() {
            return Err(ConfigError::InvalidValue("CRAQ_GET_ADDRS", String::new()));
        }

        let craq_set_addr =
            env::var("CRAQ_SET_ADDR").unwrap_or_else(|_| "127.0.0.1:10499".to_string());

        let key_prefix = match env::var("OSEG_KEY_PREFIX") {
            Ok(val) => {
                let mut bytes = val.bytes();
                match (bytes.next(), bytes.next()) {
                    (Some(b), None) if b.is_ascii_graphic() => b,
                    _ => return Err(ConfigError::InvalidValue("OSEG_KEY_PREFIX", val)),
                }
            }
            Err(_) => b'G',
        };

        let not_found_sit_out = match env::var("OSEG_NOT_FOUND_SIT_OUT_MS") {
            Ok(val) => {
                let ms: u64 = val
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("OSEG_NOT_FOUND_SIT_OUT_MS", val))?;
                Duration::from_millis(ms)
            }
            Err(_) => Duration::from_millis(500),
        };

        let health_addr =
            env::var("OSEG_HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let cache_capacity = match env::var("OSEG_CACHE_CAPACITY") {
            Ok(val) => val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("OSEG_CACHE_CAPACITY", val))?,
            Err(_) => 10_000,
        };

        Ok(Self {
            server_id,
            redis_url,
            craq_get_addrs,
            craq_set_addr,
            key_prefix,
            not_found_sit_out,
            health_addr,
            cache_capacity,
        })
    }
}
