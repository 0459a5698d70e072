use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::engine::dispatcher::OrderDispatcher;
use crate::engine::registry::{order_key, subject_key, ConnectionRegistry};
use crate::error::AppError;
use crate::events::{BusEvent, BRIDGE_CHANNELS};
use crate::models::location::{LocationUpdate, SubjectType};
use crate::observability::metrics::Metrics;
use crate::store::{BusStream, EventBus};

/// Routes bus events to live connections.
///
/// Holds no state between messages; everything it needs is read from the
/// registry and the dispatcher when a message arrives.
pub struct PubSubBridge {
    registry: ConnectionRegistry,
    dispatcher: Arc<OrderDispatcher>,
    metrics: Metrics,
}

impl PubSubBridge {
    pub fn new(registry: ConnectionRegistry, dispatcher: Arc<OrderDispatcher>, metrics: Metrics) -> Self {
        Self {
            registry,
            dispatcher,
            metrics,
        }
    }

    /// Subscribes before returning, so nothing published after this call is
    /// missed by the spawned consumer.
    pub async fn spawn(self, bus: &dyn EventBus) -> Result<JoinHandle<()>, AppError> {
        let stream = bus.subscribe(&BRIDGE_CHANNELS).await?;
        info!(channels = ?BRIDGE_CHANNELS, "pubsub bridge subscribed");
        Ok(tokio::spawn(self.run(stream)))
    }

    pub async fn run(self, mut stream: BusStream) {
        while let Some(message) = stream.next().await {
            self.handle(&message.channel, &message.payload).await;
        }

        warn!("pubsub bridge stopped: subscription closed");
    }

    pub async fn handle(&self, channel: &str, payload: &str) {
        let event = match BusEvent::decode(channel, payload) {
            Ok(event) => event,
            Err(err) => {
                self.metrics
                    .decode_failures_total
                    .with_label_values(&[channel])
                    .inc();
                warn!(channel = %channel, error = %err, "dropping undecodable event");
                return;
            }
        };

        match event {
            BusEvent::Location(update) => {
                self.route_location(&update).await;
            }
            BusEvent::NewOrder(order) => {
                if let Err(err) = self.dispatcher.notify_available_drivers(&order).await {
                    warn!(order_id = %order.id, error = %err, "new order fan-out dropped");
                }
            }
            BusEvent::OrderStatus(update) => {
                if let Err(err) = self
                    .dispatcher
                    .complete_or_give_up(&update.order_id, &update.status)
                    .await
                {
                    warn!(order_id = %update.order_id, error = %err, "status update dropped");
                }
            }
            BusEvent::DriverLocation(location) => {
                debug!(driver_id = %location.driver_id, "driver location event");
            }
            BusEvent::OrderAssigned(assignment) => {
                debug!(order_id = %assignment.order_id, "assignment event");
            }
        }
    }

    /// Driver updates tied to an order also reach the order's observers.
    /// Customer updates only reach the customer's own key; nothing routes
    /// them to the driver side.
    async fn route_location(&self, update: &LocationUpdate) -> usize {
        let payload = match serde_json::to_string(update) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode location update");
                return 0;
            }
        };

        let mut targets = Vec::with_capacity(2);
        if update.subject_type == SubjectType::Driver {
            if let Some(order_id) = update.active_order() {
                targets.push((order_key(order_id), "order"));
            }
        }
        targets.push((
            subject_key(update.subject_type, &update.subject_id),
            update.subject_type.as_str(),
        ));

        let mut delivered = 0;
        for (key, route) in targets {
            if self.registry.send_to(key, payload.clone()).await {
                self.metrics
                    .fanout_deliveries_total
                    .with_label_values(&[route])
                    .inc();
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::PubSubBridge;
    use crate::engine::dispatcher::OrderDispatcher;
    use crate::engine::registry::{ConnectionRegistry, Sink, SinkReceiver};
    use crate::events::{DriverNotification, LOCATION_UPDATES, NEW_ORDER, ORDER_STATUS_UPDATED};
    use crate::models::driver::DriverStatus;
    use crate::models::location::{Location, LocationUpdate, SubjectType};
    use crate::models::order::Order;
    use crate::observability::metrics::Metrics;
    use crate::store::memory::MemoryStore;
    use crate::store::EventBus;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: ConnectionRegistry,
        dispatcher: Arc<OrderDispatcher>,
        bridge: PubSubBridge,
        metrics: Metrics,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let metrics = Metrics::new();
        let registry = ConnectionRegistry::spawn(256, Duration::from_millis(100), metrics.clone());
        let dispatcher = Arc::new(OrderDispatcher::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let bridge = PubSubBridge::new(registry.clone(), dispatcher.clone(), metrics.clone());
        Harness {
            store,
            registry,
            dispatcher,
            bridge,
            metrics,
        }
    }

    async fn connect(registry: &ConnectionRegistry, key: &str) -> SinkReceiver {
        let (sink, rx) = Sink::channel(16);
        registry.register(key, sink).await;
        rx
    }

    fn driver_update(order_id: Option<&str>) -> LocationUpdate {
        LocationUpdate {
            subject_id: "D1".to_string(),
            subject_type: SubjectType::Driver,
            location: Location {
                latitude: 10.0,
                longitude: 106.0,
                timestamp: 1_700_000_000,
            },
            order_id: order_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn driver_update_reaches_order_observer_and_driver_only() {
        let h = harness();
        let mut observer = connect(&h.registry, "order:O1").await;
        let mut driver = connect(&h.registry, "driver:D1").await;
        let mut customer = connect(&h.registry, "customer:whatever").await;

        let payload = serde_json::to_string(&driver_update(Some("O1"))).unwrap();
        h.bridge.handle(LOCATION_UPDATES, &payload).await;

        let seen: LocationUpdate = serde_json::from_str(&observer.recv().await.unwrap()).unwrap();
        assert_eq!(seen, driver_update(Some("O1")));
        assert!(driver.recv().await.is_some());

        h.registry.close_all().await;
        assert_eq!(customer.recv().await, None);
    }

    #[tokio::test]
    async fn customer_update_only_reaches_customer_key() {
        let h = harness();
        let mut observer = connect(&h.registry, "order:O1").await;
        let mut customer = connect(&h.registry, "customer:C1").await;

        let update = LocationUpdate {
            subject_id: "C1".to_string(),
            subject_type: SubjectType::Customer,
            order_id: Some("O1".to_string()),
            ..driver_update(None)
        };
        h.bridge
            .handle(LOCATION_UPDATES, &serde_json::to_string(&update).unwrap())
            .await;

        assert!(customer.recv().await.is_some());
        h.registry.close_all().await;
        assert_eq!(observer.recv().await, None);
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_and_dropped() {
        let h = harness();
        h.bridge.handle(LOCATION_UPDATES, "{\"subjectId\": 5").await;
        h.bridge.handle("unheard_of", "{}").await;

        let failures = h
            .metrics
            .decode_failures_total
            .with_label_values(&[LOCATION_UPDATES])
            .get();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn bridge_keeps_running_after_bad_messages() {
        let h = harness();
        let mut driver = connect(&h.registry, "driver:D1").await;
        let _task = h.bridge.spawn(h.store.as_ref()).await.unwrap();

        h.store.publish(LOCATION_UPDATES, "not json at all").await.unwrap();
        h.store.publish(NEW_ORDER, "[1, 2, 3]").await.unwrap();
        h.store
            .publish(
                LOCATION_UPDATES,
                &serde_json::to_string(&driver_update(None)).unwrap(),
            )
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), driver.recv())
            .await
            .unwrap()
            .unwrap();
        let update: LocationUpdate = serde_json::from_str(&delivered).unwrap();
        assert_eq!(update.subject_id, "D1");
    }

    #[tokio::test]
    async fn new_order_event_notifies_available_drivers() {
        let h = harness();
        h.dispatcher.update_driver_location("D1", 1.0, 1.0).await.unwrap();
        let mut driver = connect(&h.registry, "driver:D1").await;

        let order = Order {
            id: "O1".to_string(),
            ..Order::default()
        };
        h.bridge
            .handle(NEW_ORDER, &serde_json::to_string(&order).unwrap())
            .await;

        let notification: DriverNotification =
            serde_json::from_str(&driver.recv().await.unwrap()).unwrap();
        assert_eq!(notification, DriverNotification::NewOrderAvailable { order });
    }

    #[tokio::test]
    async fn terminal_status_event_releases_driver() {
        let h = harness();
        h.dispatcher
            .submit_order(Order {
                id: "O1".to_string(),
                ..Order::default()
            })
            .await
            .unwrap();
        h.dispatcher.assign("O1", "D1").await.unwrap();

        h.bridge
            .handle(ORDER_STATUS_UPDATED, r#"{"orderId": "O1", "status": "cancelled"}"#)
            .await;

        let drivers = h.dispatcher.drivers().await.unwrap();
        assert_eq!(drivers[0].status, DriverStatus::Available);
        assert!(h.dispatcher.assignment("O1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_event_without_assignment_is_a_no_op() {
        let h = harness();
        h.bridge
            .handle(ORDER_STATUS_UPDATED, r#"{"orderId": "O7", "status": "delivered"}"#)
            .await;
        assert!(h.dispatcher.assignments().await.unwrap().is_empty());
    }
}
