use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend {other:?}, expected memory or redis")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub registry_command_buffer: usize,
    pub sink_buffer_size: usize,
    pub send_timeout: Duration,
    pub location_ttl: Duration,
    pub shutdown_grace: Duration,
    pub event_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            store_backend: parse_or_default("STORE_BACKEND", StoreBackend::Memory)?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            registry_command_buffer: parse_or_default("REGISTRY_COMMAND_BUFFER", 1024)?,
            sink_buffer_size: parse_or_default("SINK_BUFFER_SIZE", 64)?,
            send_timeout: Duration::from_millis(parse_or_default("SEND_TIMEOUT_MS", 250)?),
            location_ttl: Duration::from_secs(parse_or_default("LOCATION_TTL_SECS", 86_400)?),
            shutdown_grace: Duration::from_secs(parse_or_default("SHUTDOWN_GRACE_SECS", 10)?),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_level: "info".to_string(),
            store_backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            registry_command_buffer: 1024,
            sink_buffer_size: 64,
            send_timeout: Duration::from_millis(250),
            location_ttl: Duration::from_secs(86_400),
            shutdown_grace: Duration::from_secs(10),
            event_buffer_size: 1024,
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
