use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::engine::bridge::PubSubBridge;
use crate::engine::dispatcher::OrderDispatcher;
use crate::engine::locations::LocationStore;
use crate::engine::registry::ConnectionRegistry;
use crate::error::AppError;
use crate::models::location::{LocationUpdate, SubjectType};
use crate::observability::metrics::Metrics;
use crate::store::{EventBus, KeyValueStore};

pub struct AppState {
    pub registry: ConnectionRegistry,
    pub locations: LocationStore,
    pub dispatcher: Arc<OrderDispatcher>,
    pub bus: Arc<dyn EventBus>,
    pub metrics: Metrics,
    pub sink_buffer_size: usize,
}

impl AppState {
    /// Spawns the registry actor, so this must run inside a tokio runtime.
    pub fn new(config: &Config, store: Arc<dyn KeyValueStore>, bus: Arc<dyn EventBus>) -> Self {
        let metrics = Metrics::new();
        let registry = ConnectionRegistry::spawn(
            config.registry_command_buffer,
            config.send_timeout,
            metrics.clone(),
        );
        let locations = LocationStore::new(store.clone(), bus.clone(), config.location_ttl);
        let dispatcher = Arc::new(OrderDispatcher::new(
            store,
            bus.clone(),
            registry.clone(),
            metrics.clone(),
        ));

        Self {
            registry,
            locations,
            dispatcher,
            bus,
            metrics,
            sink_buffer_size: config.sink_buffer_size,
        }
    }

    pub async fn start_bridge(&self) -> Result<JoinHandle<()>, AppError> {
        PubSubBridge::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.metrics.clone(),
        )
        .spawn(self.bus.as_ref())
        .await
    }

    /// Records a location report. Driver reports also move the driver's
    /// record in the dispatch table; that part is best-effort.
    pub async fn ingest_location(&self, update: LocationUpdate) -> Result<LocationUpdate, AppError> {
        let update = self.locations.record_update(update).await?;

        if update.subject_type == SubjectType::Driver {
            if let Err(err) = self
                .dispatcher
                .update_driver_location(
                    &update.subject_id,
                    update.location.latitude,
                    update.location.longitude,
                )
                .await
            {
                warn!(driver_id = %update.subject_id, error = %err, "driver record not updated");
            }
        }

        Ok(update)
    }
}
