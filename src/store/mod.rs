//! Key-value and pub/sub collaborators.
//!
//! The engine only talks to [`KeyValueStore`] and [`EventBus`]. Every call is a
//! single atomic per-key operation; nothing here offers cross-key transactions.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::config::{Config, StoreBackend};
use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("stored value under {key} is not valid json: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn command(command: &'static str, err: impl std::fmt::Display) -> Self {
        StoreError::Command {
            command,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `ttl` of `None` keeps the value until overwritten.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Returns whether the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Appends to the tail and returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<usize>;

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Removes up to `count` elements equal to `value`, head first, and returns
    /// how many were removed. Atomic per key.
    async fn list_remove(&self, key: &str, count: usize, value: &str) -> StoreResult<usize>;
}

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BusStream>;
}

/// The configured store, holding both the key-value and the pub/sub side.
pub enum Backend {
    Memory(Arc<MemoryStore>),
    #[cfg(feature = "redis")]
    Redis(Arc<redis::RedisStore>),
}

impl Backend {
    pub async fn connect(config: &Config) -> StoreResult<Self> {
        match config.store_backend {
            StoreBackend::Memory => Ok(Backend::Memory(Arc::new(MemoryStore::new(
                config.event_buffer_size,
            )))),
            #[cfg(feature = "redis")]
            StoreBackend::Redis => Ok(Backend::Redis(Arc::new(
                redis::RedisStore::connect(&config.redis_url).await?,
            ))),
            #[cfg(not(feature = "redis"))]
            StoreBackend::Redis => Err(StoreError::Connection(
                "redis backend requested but this build lacks the `redis` feature".to_string(),
            )),
        }
    }

    pub fn key_value(&self) -> Arc<dyn KeyValueStore> {
        match self {
            Backend::Memory(store) => store.clone() as Arc<dyn KeyValueStore>,
            #[cfg(feature = "redis")]
            Backend::Redis(store) => store.clone() as Arc<dyn KeyValueStore>,
        }
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        match self {
            Backend::Memory(store) => store.clone() as Arc<dyn EventBus>,
            #[cfg(feature = "redis")]
            Backend::Redis(store) => store.clone() as Arc<dyn EventBus>,
        }
    }

    pub async fn close(&self) {
        match self {
            Backend::Memory(_) => {}
            #[cfg(feature = "redis")]
            Backend::Redis(store) => store.quit().await,
        }
    }
}
