use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::events::LOCATION_UPDATES;
use crate::models::location::{Location, LocationUpdate, SubjectType};
use crate::store::{keys, EventBus, KeyValueStore, StoreError};

/// Latest known location per subject and per order, kept for the freshness TTL.
#[derive(Clone)]
pub struct LocationStore {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn EventBus>,
    ttl: Duration,
}

impl LocationStore {
    pub fn new(store: Arc<dyn KeyValueStore>, bus: Arc<dyn EventBus>, ttl: Duration) -> Self {
        Self { store, bus, ttl }
    }

    pub async fn set_location(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        location: &Location,
        order_id: Option<&str>,
    ) -> Result<(), AppError> {
        let encoded = serde_json::to_string(location)?;
        self.store
            .set(
                &keys::subject_location(subject_type, subject_id),
                &encoded,
                Some(self.ttl),
            )
            .await?;

        if subject_type == SubjectType::Driver {
            if let Some(order_id) = order_id.filter(|id| !id.is_empty()) {
                self.store
                    .set(&keys::order_location(order_id), &encoded, Some(self.ttl))
                    .await?;
            }
        }

        Ok(())
    }

    pub async fn get_location(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> Result<Location, AppError> {
        self.read(&keys::subject_location(subject_type, subject_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Location not found".to_string()))
    }

    pub async fn get_order_location(&self, order_id: &str) -> Result<Location, AppError> {
        self.read(&keys::order_location(order_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Location not found".to_string()))
    }

    /// Persists an update and publishes it on `location_updates`.
    pub async fn record_update(&self, update: LocationUpdate) -> Result<LocationUpdate, AppError> {
        let update = update.with_default_timestamp();

        self.set_location(
            update.subject_type,
            &update.subject_id,
            &update.location,
            update.active_order(),
        )
        .await?;

        let payload = serde_json::to_string(&update)?;
        self.bus.publish(LOCATION_UPDATES, &payload).await?;

        Ok(update)
    }

    /// Stored location for the entity a socket is watching, if still fresh.
    pub async fn snapshot(&self, watch: &WatchTarget) -> Result<Option<String>, AppError> {
        let key = match watch {
            WatchTarget::Subject(subject_type, id) => keys::subject_location(*subject_type, id),
            WatchTarget::Order(order_id) => keys::order_location(order_id),
        };
        Ok(self.store.get(&key).await?)
    }

    async fn read(&self, key: &str) -> Result<Option<Location>, AppError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };

        let location = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(location))
    }
}

/// What a socket connection is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Subject(SubjectType, String),
    Order(String),
}

impl WatchTarget {
    /// Parses the `{type}` path segment of a location socket.
    pub fn parse(kind: &str, id: &str) -> Result<Self, AppError> {
        if id.trim().is_empty() {
            return Err(AppError::BadRequest("id cannot be empty".to_string()));
        }

        match kind {
            "driver" => Ok(WatchTarget::Subject(SubjectType::Driver, id.to_string())),
            "customer" => Ok(WatchTarget::Subject(SubjectType::Customer, id.to_string())),
            "order" => Ok(WatchTarget::Order(id.to_string())),
            other => Err(AppError::BadRequest(format!(
                "unknown connection type {other:?}, expected driver, customer or order"
            ))),
        }
    }

    pub fn routing_key(&self) -> String {
        match self {
            WatchTarget::Subject(subject_type, id) => {
                crate::engine::registry::subject_key(*subject_type, id)
            }
            WatchTarget::Order(order_id) => crate::engine::registry::order_key(order_id),
        }
    }
}
