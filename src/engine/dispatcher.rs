use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::engine::registry::{driver_key, ConnectionRegistry};
use crate::error::AppError;
use crate::events::{
    DriverLocation, DriverNotification, DRIVER_LOCATION_UPDATED, NEW_ORDER, ORDER_ASSIGNED,
    ORDER_STATUS_UPDATED,
};
use crate::models::assignment::OrderAssignment;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::order::{is_terminal_status, Order, OrderStatusUpdate};
use crate::observability::metrics::Metrics;
use crate::store::keys::{DRIVERS, ORDER_ASSIGNMENTS, PENDING_ORDERS};
use crate::store::{EventBus, KeyValueStore, StoreError};

/// Owns the pending queue, driver status and assignment records.
///
/// The store only offers atomic single-key operations, so multi-key steps are
/// ordered to fail towards a recoverable state: an order leaves the queue
/// before its assignment is written, and an assignment is deleted before its
/// driver becomes available again. If a later step of an assignment fails, the
/// earlier writes are undone and the order goes back to the queue. Mutations
/// of one driver are serialized by a per-driver lock held for the whole
/// transition.
pub struct OrderDispatcher {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn EventBus>,
    registry: ConnectionRegistry,
    driver_locks: DashMap<String, Arc<Mutex<()>>>,
    queue_lock: Mutex<()>,
    metrics: Metrics,
}

impl OrderDispatcher {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn EventBus>,
        registry: ConnectionRegistry,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            driver_locks: DashMap::new(),
            queue_lock: Mutex::new(()),
            metrics,
        }
    }

    pub async fn submit_order(&self, order: Order) -> Result<Order, AppError> {
        if order.id.trim().is_empty() {
            return Err(AppError::BadRequest("order id cannot be empty".to_string()));
        }

        if !self.enqueue_if_absent(&order).await? {
            return Err(AppError::Conflict(format!(
                "order {} is already pending or assigned",
                order.id
            )));
        }

        let payload = serde_json::to_string(&order)?;
        self.bus.publish(NEW_ORDER, &payload).await?;

        info!(order_id = %order.id, "order submitted");
        Ok(order)
    }

    /// Appends `order` to the pending queue unless an order with the same id
    /// is already queued or assigned.
    pub async fn enqueue_if_absent(&self, order: &Order) -> Result<bool, AppError> {
        let _guard = self.queue_lock.lock().await;

        if self.find_pending(&order.id).await?.is_some()
            || self.assignment(&order.id).await?.is_some()
        {
            return Ok(false);
        }

        let encoded = serde_json::to_string(order)?;
        let len = self.store.list_push(PENDING_ORDERS, &encoded).await?;
        self.metrics.pending_orders.set(len as i64);
        Ok(true)
    }

    pub async fn pending_orders(&self) -> Result<Vec<Order>, AppError> {
        let raw_orders = self.store.list_range(PENDING_ORDERS).await?;
        let orders: Vec<Order> = raw_orders
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(order) => Some(order),
                Err(err) => {
                    warn!(error = %err, "skipping malformed pending order");
                    None
                }
            })
            .collect();

        self.metrics.pending_orders.set(orders.len() as i64);
        Ok(orders)
    }

    /// Moves a pending order to `driver_id`.
    ///
    /// Removing the exact queue element is the point where concurrent callers
    /// for the same order are decided: exactly one removal succeeds and every
    /// other caller gets [`AppError::OrderNotFound`].
    pub async fn assign(&self, order_id: &str, driver_id: &str) -> Result<OrderAssignment, AppError> {
        if driver_id.trim().is_empty() {
            return Err(AppError::BadRequest("driverId cannot be empty".to_string()));
        }

        let start = Instant::now();
        let result = self.try_assign(order_id, driver_id).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(AppError::OrderNotFound(_)) => "order_not_found",
            Err(AppError::Conflict(_)) => "conflict",
            Err(_) => "error",
        };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .assignments_total
            .with_label_values(&[outcome])
            .inc();

        result
    }

    async fn try_assign(&self, order_id: &str, driver_id: &str) -> Result<OrderAssignment, AppError> {
        let _driver = self.lock_driver(driver_id).await;

        let Some((queued, _order)) = self.find_pending(order_id).await? else {
            return Err(AppError::OrderNotFound(order_id.to_string()));
        };
        if self.assignment(order_id).await?.is_some() {
            return Err(AppError::Conflict(format!("order {order_id} is already assigned")));
        }

        let driver = self.load_driver(driver_id).await?;
        match driver.as_ref().map(|driver| driver.status) {
            Some(DriverStatus::Busy) => {
                return Err(AppError::Conflict(format!(
                    "driver {driver_id} already has an active order"
                )));
            }
            Some(DriverStatus::Offline) => {
                return Err(AppError::Conflict(format!("driver {driver_id} is offline")));
            }
            Some(DriverStatus::Available) | None => {}
        }

        let assignment = OrderAssignment::new(order_id, driver_id);
        let encoded = serde_json::to_string(&assignment)?;
        let mut driver = driver.unwrap_or_else(|| Driver {
            id: driver_id.to_string(),
            ..Driver::default()
        });
        driver.status = DriverStatus::Busy;

        {
            // Held until the assignment is written so a resubmission cannot
            // slip in while the order is in neither place.
            let _queue = self.queue_lock.lock().await;

            if self.store.list_remove(PENDING_ORDERS, 1, &queued).await? == 0 {
                return Err(AppError::OrderNotFound(order_id.to_string()));
            }
            self.metrics.pending_orders.dec();

            if let Err(err) = self
                .store
                .hash_set(ORDER_ASSIGNMENTS, order_id, &encoded)
                .await
            {
                self.requeue(order_id, &queued).await;
                return Err(err.into());
            }

            if let Err(err) = self.save_driver(&driver).await {
                match self.store.hash_delete(ORDER_ASSIGNMENTS, order_id).await {
                    Ok(_) => self.requeue(order_id, &queued).await,
                    Err(rollback) => error!(
                        order_id = %order_id,
                        driver_id = %driver_id,
                        error = %rollback,
                        "assignment recorded but driver not marked busy; cancel the order to release it"
                    ),
                }
                return Err(err);
            }
        }

        if let Err(err) = self.bus.publish(ORDER_ASSIGNED, &encoded).await {
            warn!(order_id = %order_id, error = %err, "failed to publish order assignment");
        }

        let delivered = self
            .notify_driver(
                driver_id,
                &DriverNotification::OrderAssigned {
                    assignment: assignment.clone(),
                },
            )
            .await;

        info!(
            order_id = %order_id,
            driver_id = %driver_id,
            delivered,
            "order assigned"
        );
        Ok(assignment)
    }

    /// Puts an order taken by a failed assignment back at the tail of the
    /// queue. Caller holds the queue lock.
    async fn requeue(&self, order_id: &str, queued: &str) {
        match self.store.list_push(PENDING_ORDERS, queued).await {
            Ok(len) => {
                self.metrics.pending_orders.set(len as i64);
                warn!(order_id = %order_id, "assignment rolled back; order requeued");
            }
            Err(err) => error!(
                order_id = %order_id,
                error = %err,
                "order left the queue but was not assigned; resubmit to recover"
            ),
        }
    }

    /// Releases the driver of a finished order. Anything other than a
    /// terminal status, or an order without an active assignment, is a no-op.
    pub async fn complete_or_give_up(
        &self,
        order_id: &str,
        status: &str,
    ) -> Result<Option<OrderAssignment>, AppError> {
        if !is_terminal_status(status) {
            debug!(order_id = %order_id, status = %status, "non-terminal status ignored");
            return Ok(None);
        }

        let Some(assignment) = self.assignment(order_id).await? else {
            debug!(order_id = %order_id, "no active assignment");
            return Ok(None);
        };

        let _driver = self.lock_driver(&assignment.driver_id).await;

        // Whoever deletes the record owns the release.
        if !self.store.hash_delete(ORDER_ASSIGNMENTS, order_id).await? {
            return Ok(None);
        }

        match self.load_driver(&assignment.driver_id).await? {
            Some(mut driver) => {
                driver.status = DriverStatus::Available;
                self.save_driver(&driver).await?;
            }
            None => warn!(driver_id = %assignment.driver_id, "released driver has no record"),
        }

        self.notify_driver(
            &assignment.driver_id,
            &DriverNotification::OrderCompleted {
                order_id: order_id.to_string(),
            },
        )
        .await;

        info!(
            order_id = %order_id,
            driver_id = %assignment.driver_id,
            status = %status,
            "order finished; driver released"
        );
        Ok(Some(assignment))
    }

    /// Pushes `new_order_available` to every connected driver that is
    /// currently available. All available drivers are candidates; there is no
    /// proximity filter. Returns how many sockets accepted the notification.
    pub async fn notify_available_drivers(&self, order: &Order) -> Result<usize, AppError> {
        let drivers = self.drivers().await?;
        let payload = serde_json::to_string(&DriverNotification::NewOrderAvailable {
            order: order.clone(),
        })?;

        let mut notified = 0;
        for driver in drivers.iter().filter(|driver| driver.is_available()) {
            if self
                .registry
                .send_to(driver_key(&driver.id), payload.clone())
                .await
            {
                notified += 1;
            }
        }

        self.metrics
            .fanout_deliveries_total
            .with_label_values(&["new_order"])
            .inc_by(notified as u64);
        debug!(order_id = %order.id, notified, "new order fanned out");
        Ok(notified)
    }

    pub async fn update_driver_location(
        &self,
        driver_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Driver, AppError> {
        if driver_id.trim().is_empty() {
            return Err(AppError::BadRequest("driver id cannot be empty".to_string()));
        }

        let driver = {
            let _driver = self.lock_driver(driver_id).await;

            let mut driver = self
                .load_driver(driver_id)
                .await?
                .unwrap_or_else(|| Driver::new_at(driver_id, latitude, longitude));
            driver.latitude = latitude;
            driver.longitude = longitude;
            self.save_driver(&driver).await?;
            driver
        };

        let event = DriverLocation {
            driver_id: driver_id.to_string(),
            latitude,
            longitude,
        };
        self.bus
            .publish(DRIVER_LOCATION_UPDATED, &serde_json::to_string(&event)?)
            .await?;

        Ok(driver)
    }

    /// Creates or refreshes a driver's profile. The status of an existing
    /// driver is left alone; it only changes through assignment or
    /// [`OrderDispatcher::set_driver_status`].
    pub async fn register_driver(&self, mut profile: Driver) -> Result<Driver, AppError> {
        if profile.id.trim().is_empty() {
            return Err(AppError::BadRequest("driver id cannot be empty".to_string()));
        }
        if profile.status == DriverStatus::Busy {
            return Err(AppError::BadRequest(
                "drivers become busy only through assignment".to_string(),
            ));
        }

        let _driver = self.lock_driver(&profile.id).await;

        if let Some(existing) = self.load_driver(&profile.id).await? {
            profile.status = existing.status;
        }
        self.save_driver(&profile).await?;

        info!(driver_id = %profile.id, status = ?profile.status, "driver registered");
        Ok(profile)
    }

    /// Moves a driver between `available` and `offline`.
    pub async fn set_driver_status(
        &self,
        driver_id: &str,
        status: DriverStatus,
    ) -> Result<Driver, AppError> {
        if status == DriverStatus::Busy {
            return Err(AppError::BadRequest(
                "drivers become busy only through assignment".to_string(),
            ));
        }

        let _driver = self.lock_driver(driver_id).await;

        let mut driver = self
            .load_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

        if driver.status == DriverStatus::Busy {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} has an active order"
            )));
        }

        driver.status = status;
        self.save_driver(&driver).await?;
        Ok(driver)
    }

    /// Publishes a status change for an order on `order_status_updated`.
    pub async fn publish_status(
        &self,
        order_id: &str,
        status: &str,
    ) -> Result<OrderStatusUpdate, AppError> {
        if status.trim().is_empty() {
            return Err(AppError::BadRequest("status cannot be empty".to_string()));
        }

        let update = OrderStatusUpdate {
            order_id: order_id.to_string(),
            status: status.to_string(),
        };
        self.bus
            .publish(ORDER_STATUS_UPDATED, &serde_json::to_string(&update)?)
            .await?;
        Ok(update)
    }

    pub async fn drivers(&self) -> Result<Vec<Driver>, AppError> {
        let raw_drivers = self.store.hash_get_all(DRIVERS).await?;
        let mut drivers: Vec<Driver> = raw_drivers
            .into_iter()
            .filter_map(|(id, raw)| match serde_json::from_str::<Driver>(&raw) {
                Ok(mut driver) => {
                    driver.id = id;
                    Some(driver)
                }
                Err(err) => {
                    warn!(driver_id = %id, error = %err, "skipping malformed driver record");
                    None
                }
            })
            .collect();

        drivers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(drivers)
    }

    pub async fn assignment(&self, order_id: &str) -> Result<Option<OrderAssignment>, AppError> {
        let Some(raw) = self.store.hash_get(ORDER_ASSIGNMENTS, order_id).await? else {
            return Ok(None);
        };

        let assignment = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            key: format!("{ORDER_ASSIGNMENTS}/{order_id}"),
            source,
        })?;
        Ok(Some(assignment))
    }

    pub async fn assignments(&self) -> Result<Vec<OrderAssignment>, AppError> {
        let raw_assignments = self.store.hash_get_all(ORDER_ASSIGNMENTS).await?;
        let mut assignments: Vec<OrderAssignment> = raw_assignments
            .values()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        assignments.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at));
        Ok(assignments)
    }

    async fn notify_driver(&self, driver_id: &str, notification: &DriverNotification) -> bool {
        let payload = match serde_json::to_string(notification) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(driver_id = %driver_id, error = %err, "failed to encode driver notification");
                return false;
            }
        };

        let delivered = self.registry.send_to(driver_key(driver_id), payload).await;
        if delivered {
            self.metrics
                .fanout_deliveries_total
                .with_label_values(&["driver"])
                .inc();
        }
        delivered
    }

    async fn find_pending(&self, order_id: &str) -> Result<Option<(String, Order)>, AppError> {
        let queued = self.store.list_range(PENDING_ORDERS).await?;

        for raw in queued {
            match serde_json::from_str::<Order>(&raw) {
                Ok(order) if order.id == order_id => return Ok(Some((raw, order))),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping malformed pending order"),
            }
        }
        Ok(None)
    }

    /// Unreadable driver records are treated as absent so the next write
    /// replaces them.
    async fn load_driver(&self, driver_id: &str) -> Result<Option<Driver>, AppError> {
        let Some(raw) = self.store.hash_get(DRIVERS, driver_id).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Driver>(&raw) {
            Ok(mut driver) => {
                driver.id = driver_id.to_string();
                Ok(Some(driver))
            }
            Err(err) => {
                warn!(driver_id = %driver_id, error = %err, "replacing malformed driver record");
                Ok(None)
            }
        }
    }

    async fn save_driver(&self, driver: &Driver) -> Result<(), AppError> {
        let encoded = serde_json::to_string(driver)?;
        self.store.hash_set(DRIVERS, &driver.id, &encoded).await?;
        Ok(())
    }

    async fn lock_driver(&self, driver_id: &str) -> DriverGuard<'_> {
        let lock = self
            .driver_locks
            .entry(driver_id.to_string())
            .or_default()
            .clone();

        DriverGuard {
            locks: &self.driver_locks,
            driver_id: driver_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Holds one driver's lock; the map entry is dropped with the last holder.
struct DriverGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    driver_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.driver_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use super::OrderDispatcher;
    use crate::engine::registry::{ConnectionRegistry, Sink};
    use crate::error::AppError;
    use crate::events::{DriverNotification, NEW_ORDER};
    use crate::models::driver::{Driver, DriverStatus};
    use crate::models::order::Order;
    use crate::observability::metrics::Metrics;
    use crate::store::keys::{DRIVERS, ORDER_ASSIGNMENTS, PENDING_ORDERS};
    use crate::store::memory::MemoryStore;
    use crate::store::{EventBus, KeyValueStore, StoreError, StoreResult};

    /// Memory store whose driver-table writes can be switched to fail.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        fail_driver_writes: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
            self.inner.hash_get(key, field).await
        }

        async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
            if key == DRIVERS && self.fail_driver_writes.load(Ordering::SeqCst) {
                return Err(StoreError::command("HSET", "connection reset"));
            }
            self.inner.hash_set(key, field, value).await
        }

        async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
            self.inner.hash_get_all(key).await
        }

        async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
            self.inner.hash_delete(key, field).await
        }

        async fn list_push(&self, key: &str, value: &str) -> StoreResult<usize> {
            self.inner.list_push(key, value).await
        }

        async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.list_range(key).await
        }

        async fn list_remove(&self, key: &str, count: usize, value: &str) -> StoreResult<usize> {
            self.inner.list_remove(key, count, value).await
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        registry: ConnectionRegistry,
        dispatcher: Arc<OrderDispatcher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let metrics = Metrics::new();
        let registry = ConnectionRegistry::spawn(256, Duration::from_millis(100), metrics.clone());
        let dispatcher = Arc::new(OrderDispatcher::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            metrics,
        ));
        Harness {
            store,
            registry,
            dispatcher,
        }
    }

    fn order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            order_number: format!("ORD-{id}"),
            restaurant_id: "r-1".to_string(),
            user_id: "u-1".to_string(),
            status: "pending".to_string(),
            delivery_address: "1 Le Loi".to_string(),
            estimated_delivery_time: None,
        }
    }

    async fn connect(registry: &ConnectionRegistry, key: &str) -> crate::engine::registry::SinkReceiver {
        let (sink, rx) = Sink::channel(16);
        registry.register(key, sink).await;
        rx
    }

    fn decode(payload: Option<String>) -> DriverNotification {
        serde_json::from_str(&payload.expect("payload delivered")).unwrap()
    }

    #[tokio::test]
    async fn submit_queues_and_publishes() {
        let h = harness();
        let mut stream = h.store.subscribe(&[NEW_ORDER]).await.unwrap();

        h.dispatcher.submit_order(order("o-1")).await.unwrap();

        let pending = h.dispatcher.pending_orders().await.unwrap();
        assert_eq!(pending, vec![order("o-1")]);

        let message = stream.next().await.unwrap();
        let published: Order = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(published.id, "o-1");
    }

    #[tokio::test]
    async fn duplicate_and_blank_orders_are_rejected() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();

        let err = h.dispatcher.submit_order(order("o-1")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = h.dispatcher.submit_order(order(" ")).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        assert_eq!(h.dispatcher.pending_orders().await.unwrap().len(), 1);
        assert!(!h.dispatcher.enqueue_if_absent(&order("o-1")).await.unwrap());
    }

    #[tokio::test]
    async fn assign_marks_driver_busy_and_notifies_driver() {
        let h = harness();
        h.dispatcher.update_driver_location("d-1", 10.0, 106.0).await.unwrap();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        let mut driver_rx = connect(&h.registry, "driver:d-1").await;

        let assignment = h.dispatcher.assign("o-1", "d-1").await.unwrap();
        assert_eq!(assignment.order_id, "o-1");
        assert_eq!(assignment.driver_id, "d-1");

        let drivers = h.dispatcher.drivers().await.unwrap();
        assert_eq!(drivers[0].status, DriverStatus::Busy);
        assert_eq!(drivers[0].latitude, 10.0);
        assert!(h.dispatcher.pending_orders().await.unwrap().is_empty());
        assert_eq!(
            h.dispatcher.assignment("o-1").await.unwrap(),
            Some(assignment.clone())
        );

        match decode(driver_rx.recv().await) {
            DriverNotification::OrderAssigned { assignment: pushed } => {
                assert_eq!(pushed, assignment)
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn assigning_unknown_order_mutates_nothing() {
        let h = harness();

        let err = h.dispatcher.assign("o-9", "d-1").await.unwrap_err();
        assert!(matches!(err, AppError::OrderNotFound(id) if id == "o-9"));

        assert!(h.dispatcher.drivers().await.unwrap().is_empty());
        assert!(h.dispatcher.assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_driver_cannot_take_second_order() {
        let h = harness();
        h.dispatcher.update_driver_location("d-1", 1.0, 1.0).await.unwrap();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.submit_order(order("o-2")).await.unwrap();

        h.dispatcher.assign("o-1", "d-1").await.unwrap();
        let err = h.dispatcher.assign("o-2", "d-1").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let pending = h.dispatcher.pending_orders().await.unwrap();
        assert_eq!(pending, vec![order("o-2")]);
        assert!(h.dispatcher.assignment("o-2").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_assigns_for_one_order_have_one_winner() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let dispatcher = h.dispatcher.clone();
            // Half the callers race with the same driver, half with distinct ones.
            let driver_id = if n % 2 == 0 {
                "d-shared".to_string()
            } else {
                format!("d-{n}")
            };
            handles.push(tokio::spawn(async move {
                dispatcher.assign("o-1", &driver_id).await
            }));
        }

        let mut winners = 0;
        let mut not_found = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(AppError::OrderNotFound(_)) => not_found += 1,
                Err(other) => panic!("unexpected error {other}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(not_found, 15);

        let busy: Vec<Driver> = h
            .dispatcher
            .drivers()
            .await
            .unwrap()
            .into_iter()
            .filter(|driver| driver.status == DriverStatus::Busy)
            .collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(h.dispatcher.assignments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivered_order_releases_driver() {
        let h = harness();
        h.dispatcher.update_driver_location("d-1", 1.0, 1.0).await.unwrap();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();
        let mut driver_rx = connect(&h.registry, "driver:d-1").await;

        let released = h
            .dispatcher
            .complete_or_give_up("o-1", "delivered")
            .await
            .unwrap();
        assert_eq!(released.map(|a| a.driver_id).as_deref(), Some("d-1"));

        let drivers = h.dispatcher.drivers().await.unwrap();
        assert_eq!(drivers[0].status, DriverStatus::Available);
        assert!(h.dispatcher.assignment("o-1").await.unwrap().is_none());

        assert_eq!(
            decode(driver_rx.recv().await),
            DriverNotification::OrderCompleted {
                order_id: "o-1".to_string()
            }
        );

        // A second terminal event finds nothing left to release.
        assert!(h
            .dispatcher
            .complete_or_give_up("o-1", "cancelled")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn non_terminal_status_keeps_assignment() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();

        let result = h
            .dispatcher
            .complete_or_give_up("o-1", "picked_up")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(h.dispatcher.assignment("o-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn new_order_reaches_only_available_drivers() {
        let h = harness();
        h.dispatcher.update_driver_location("D1", 1.0, 1.0).await.unwrap();
        h.dispatcher.update_driver_location("D2", 2.0, 2.0).await.unwrap();
        h.dispatcher.submit_order(order("busy-job")).await.unwrap();
        h.dispatcher.assign("busy-job", "D2").await.unwrap();

        let mut d1_rx = connect(&h.registry, "driver:D1").await;
        let mut d2_rx = connect(&h.registry, "driver:D2").await;

        let notified = h
            .dispatcher
            .notify_available_drivers(&order("O1"))
            .await
            .unwrap();
        assert_eq!(notified, 1);

        match decode(d1_rx.recv().await) {
            DriverNotification::NewOrderAvailable { order } => assert_eq!(order.id, "O1"),
            other => panic!("unexpected notification {other:?}"),
        }

        h.registry.close_all().await;
        assert_eq!(d2_rx.recv().await, None);
    }

    #[tokio::test]
    async fn driver_location_update_keeps_status() {
        let h = harness();
        let created = h
            .dispatcher
            .update_driver_location("d-1", 1.0, 2.0)
            .await
            .unwrap();
        assert_eq!(created.status, DriverStatus::Available);

        h.dispatcher
            .set_driver_status("d-1", DriverStatus::Offline)
            .await
            .unwrap();
        let moved = h
            .dispatcher
            .update_driver_location("d-1", 3.0, 4.0)
            .await
            .unwrap();
        assert_eq!(moved.status, DriverStatus::Offline);
        assert_eq!((moved.latitude, moved.longitude), (3.0, 4.0));
    }

    #[tokio::test]
    async fn busy_is_not_a_manual_status() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();

        let err = h
            .dispatcher
            .set_driver_status("d-1", DriverStatus::Offline)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = h
            .dispatcher
            .register_driver(Driver {
                id: "d-2".to_string(),
                status: DriverStatus::Busy,
                ..Driver::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn assigned_order_cannot_be_resubmitted_or_reassigned() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();

        let err = h.dispatcher.submit_order(order("o-1")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(h.dispatcher.pending_orders().await.unwrap().is_empty());

        let err = h.dispatcher.assign("o-1", "d-2").await.unwrap_err();
        assert!(matches!(err, AppError::OrderNotFound(_)));

        let busy = h
            .dispatcher
            .drivers()
            .await
            .unwrap()
            .into_iter()
            .filter(|driver| driver.status == DriverStatus::Busy)
            .count();
        assert_eq!(busy, 1);
        assert_eq!(
            h.dispatcher.assignment("o-1").await.unwrap().map(|a| a.driver_id),
            Some("d-1".to_string())
        );
    }

    #[tokio::test]
    async fn queued_copy_of_assigned_order_is_not_reassigned() {
        let h = harness();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();
        h.store
            .list_push(PENDING_ORDERS, &serde_json::to_string(&order("o-1")).unwrap())
            .await
            .unwrap();

        let err = h.dispatcher.assign("o-1", "d-2").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let drivers = h.dispatcher.drivers().await.unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].id, "d-1");
        assert_eq!(
            h.dispatcher.assignment("o-1").await.unwrap().map(|a| a.driver_id),
            Some("d-1".to_string())
        );
    }

    #[tokio::test]
    async fn offline_driver_cannot_be_assigned() {
        let h = harness();
        h.dispatcher.update_driver_location("d-1", 1.0, 1.0).await.unwrap();
        h.dispatcher
            .set_driver_status("d-1", DriverStatus::Offline)
            .await
            .unwrap();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();

        let err = h.dispatcher.assign("o-1", "d-1").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let drivers = h.dispatcher.drivers().await.unwrap();
        assert_eq!(drivers[0].status, DriverStatus::Offline);
        assert_eq!(h.dispatcher.pending_orders().await.unwrap(), vec![order("o-1")]);
        assert!(h.dispatcher.assignment("o-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_driver_write_rolls_back_assignment() {
        let memory = Arc::new(MemoryStore::default());
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            fail_driver_writes: AtomicBool::new(false),
        });
        let metrics = Metrics::new();
        let registry = ConnectionRegistry::spawn(16, Duration::from_millis(100), metrics.clone());
        let dispatcher = OrderDispatcher::new(store.clone(), memory.clone(), registry, metrics);

        dispatcher.update_driver_location("d-1", 1.0, 1.0).await.unwrap();
        dispatcher.submit_order(order("o-1")).await.unwrap();
        store.fail_driver_writes.store(true, Ordering::SeqCst);

        let err = dispatcher.assign("o-1", "d-1").await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));

        assert!(memory.hash_get(ORDER_ASSIGNMENTS, "o-1").await.unwrap().is_none());
        assert_eq!(dispatcher.pending_orders().await.unwrap(), vec![order("o-1")]);
        assert_eq!(
            dispatcher.drivers().await.unwrap()[0].status,
            DriverStatus::Available
        );

        store.fail_driver_writes.store(false, Ordering::SeqCst);
        dispatcher.assign("o-1", "d-1").await.unwrap();
        assert_eq!(dispatcher.drivers().await.unwrap()[0].status, DriverStatus::Busy);
    }

    #[tokio::test]
    async fn idle_driver_locks_are_dropped() {
        let h = harness();
        h.dispatcher.update_driver_location("d-1", 1.0, 1.0).await.unwrap();
        h.dispatcher.submit_order(order("o-1")).await.unwrap();
        h.dispatcher.assign("o-1", "d-1").await.unwrap();
        let _ = h.dispatcher.assign("o-9", "d-ghost").await;
        h.dispatcher
            .complete_or_give_up("o-1", "delivered")
            .await
            .unwrap();

        assert!(h.dispatcher.driver_locks.is_empty());
    }
}
