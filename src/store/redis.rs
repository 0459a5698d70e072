use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::{BusMessage, BusStream, EventBus, KeyValueStore, StoreError, StoreResult};

/// Redis-backed store. Pub/sub runs on a second connection because a
/// subscribed connection cannot issue regular commands.
pub struct RedisStore {
    client: Client,
    subscriber: Client,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let config =
            Config::from_url(url).map_err(|err| StoreError::Connection(err.to_string()))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        client
            .init()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;

        let subscriber = client.clone_new();
        subscriber
            .init()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;

        info!("connected to redis");
        Ok(Self { client, subscriber })
    }

    pub async fn quit(&self) {
        if let Err(err) = self.subscriber.quit().await {
            warn!(error = %err, "redis subscriber quit failed");
        }
        if let Err(err) = self.client.quit().await {
            warn!(error = %err, "redis client quit failed");
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.client
            .get::<Option<String>, _>(key)
            .await
            .map_err(|err| StoreError::command("GET", err))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expiration = ttl.map(|ttl| Expiration::EX(ttl.as_secs().max(1) as i64));
        self.client
            .set::<(), _, _>(key, value, expiration, None, false)
            .await
            .map_err(|err| StoreError::command("SET", err))
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.client
            .hget::<Option<String>, _, _>(key, field)
            .await
            .map_err(|err| StoreError::command("HGET", err))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let values = HashMap::from([(field.to_string(), value.to_string())]);
        self.client
            .hset::<i64, _, _>(key, values)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::command("HSET", err))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.client
            .hgetall::<HashMap<String, String>, _>(key)
            .await
            .map_err(|err| StoreError::command("HGETALL", err))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.client
            .hdel::<i64, _, _>(key, field)
            .await
            .map(|removed| removed > 0)
            .map_err(|err| StoreError::command("HDEL", err))
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.client
            .rpush::<i64, _, _>(key, value)
            .await
            .map(|len| len.max(0) as usize)
            .map_err(|err| StoreError::command("RPUSH", err))
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.client
            .lrange::<Vec<String>, _>(key, 0, -1)
            .await
            .map_err(|err| StoreError::command("LRANGE", err))
    }

    async fn list_remove(&self, key: &str, count: usize, value: &str) -> StoreResult<usize> {
        self.client
            .lrem::<i64, _, _>(key, count as i64, value)
            .await
            .map(|removed| removed.max(0) as usize)
            .map_err(|err| StoreError::command("LREM", err))
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.client
            .publish::<i64, _, _>(channel, payload)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::command("PUBLISH", err))
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BusStream> {
        let wanted: HashSet<String> = channels.iter().map(|channel| channel.to_string()).collect();
        let rx = self.subscriber.message_rx();

        self.subscriber
            .subscribe(wanted.iter().cloned().collect::<Vec<_>>())
            .await
            .map_err(|err| StoreError::command("SUBSCRIBE", err))?;

        let stream = BroadcastStream::new(rx).filter_map(move |result| {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "redis message stream lagged");
                    return None;
                }
            };

            let channel = message.channel.to_string();
            if !wanted.contains(&channel) {
                return None;
            }

            match message.value.as_string() {
                Some(payload) => Some(BusMessage { channel, payload }),
                None => {
                    warn!(channel = %channel, "non-string pubsub payload dropped");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
