use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::{BusMessage, BusStream, EventBus, KeyValueStore, StoreResult};

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Single-process store and bus. Each dashmap shard lock makes per-key
/// operations atomic; pub/sub is a broadcast channel shared by every subscriber.
pub struct MemoryStore {
    strings: DashMap<String, StringEntry>,
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
    bus_tx: broadcast::Sender<BusMessage>,
}

impl MemoryStore {
    pub fn new(event_buffer_size: usize) -> Self {
        let (bus_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));

        Self {
            strings: DashMap::new(),
            hashes: DashMap::new(),
            lists: DashMap::new(),
            bus_tx,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let expired = match self.strings.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.strings.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = StringEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.strings.insert(key.to_string(), entry);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.clone())
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self
            .hashes
            .get_mut(key)
            .is_some_and(|mut hash| hash.remove(field).is_some()))
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        Ok(list.len())
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn list_remove(&self, key: &str, count: usize, value: &str) -> StoreResult<usize> {
        let Some(mut list) = self.lists.get_mut(key) else {
            return Ok(0);
        };

        let mut removed = 0;
        list.retain(|element| {
            if removed < count && element == value {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[async_trait]
impl EventBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // No live subscriber is not an error; pub/sub is fire-and-forget.
        let _ = self.bus_tx.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BusStream> {
        let wanted: HashSet<String> = channels.iter().map(|channel| channel.to_string()).collect();
        let rx = self.bus_tx.subscribe();

        let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
            Ok(message) if wanted.contains(&message.channel) => Some(message),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "bus subscriber lagged; messages dropped");
                None
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::MemoryStore;
    use crate::store::{EventBus, KeyValueStore};

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::default();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_remove_takes_only_count_matches() {
        let store = MemoryStore::default();
        for value in ["a", "b", "a", "a"] {
            store.list_push("l", value).await.unwrap();
        }

        assert_eq!(store.list_remove("l", 2, "a").await.unwrap(), 2);
        assert_eq!(store.list_range("l").await.unwrap(), vec!["b", "a"]);
        assert_eq!(store.list_remove("l", 1, "zzz").await.unwrap(), 0);
        assert_eq!(store.list_remove("missing", 1, "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hash_delete_reports_presence() {
        let store = MemoryStore::default();
        store.hash_set("h", "f", "1").await.unwrap();
        assert!(store.hash_delete("h", "f").await.unwrap());
        assert!(!store.hash_delete("h", "f").await.unwrap());
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_only_see_their_channels() {
        let store = MemoryStore::default();
        let mut stream = store.subscribe(&["wanted"]).await.unwrap();

        store.publish("ignored", "x").await.unwrap();
        store.publish("wanted", "y").await.unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message.channel, "wanted");
        assert_eq!(message.payload, "y");
    }
}
