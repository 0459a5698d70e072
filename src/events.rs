//! Event bus channels and the JSON envelopes carried on them.
//!
//! Inbound bus payloads are decoded into [`BusEvent`]; notifications pushed to
//! driver sockets are [`DriverNotification`]s, tagged by a `type` field.

use serde::{Deserialize, Serialize};

use crate::models::assignment::OrderAssignment;
use crate::models::location::LocationUpdate;
use crate::models::order::{Order, OrderStatusUpdate};

pub const LOCATION_UPDATES: &str = "location_updates";
pub const NEW_ORDER: &str = "new_order";
pub const ORDER_STATUS_UPDATED: &str = "order_status_updated";
/// Name used by the upstream orders gateway for the same payload.
pub const ORDER_STATUS_UPDATE_LEGACY: &str = "order_status_update";
pub const ORDER_ASSIGNED: &str = "order_assigned";
pub const DRIVER_LOCATION_UPDATED: &str = "driver_location_updated";

/// Channels the bridge listens on.
pub const BRIDGE_CHANNELS: [&str; 5] = [
    LOCATION_UPDATES,
    NEW_ORDER,
    ORDER_STATUS_UPDATED,
    ORDER_STATUS_UPDATE_LEGACY,
    DRIVER_LOCATION_UPDATED,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocation {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Messages pushed directly to a driver's socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverNotification {
    NewOrderAvailable {
        order: Order,
    },
    OrderAssigned {
        assignment: OrderAssignment,
    },
    OrderCompleted {
        #[serde(rename = "orderId")]
        order_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Location(LocationUpdate),
    NewOrder(Order),
    OrderStatus(OrderStatusUpdate),
    OrderAssigned(OrderAssignment),
    DriverLocation(DriverLocation),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown channel {0}")]
    UnknownChannel(String),

    #[error("malformed {channel} payload: {source}")]
    Malformed {
        channel: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BusEvent {
    pub fn decode(channel: &str, payload: &str) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Malformed {
            channel: channel.to_string(),
            source,
        };

        match channel {
            LOCATION_UPDATES => serde_json::from_str(payload)
                .map(BusEvent::Location)
                .map_err(malformed),
            NEW_ORDER => serde_json::from_str(payload)
                .map(BusEvent::NewOrder)
                .map_err(malformed),
            ORDER_STATUS_UPDATED | ORDER_STATUS_UPDATE_LEGACY => serde_json::from_str(payload)
                .map(BusEvent::OrderStatus)
                .map_err(malformed),
            ORDER_ASSIGNED => serde_json::from_str(payload)
                .map(BusEvent::OrderAssigned)
                .map_err(malformed),
            DRIVER_LOCATION_UPDATED => serde_json::from_str(payload)
                .map(BusEvent::DriverLocation)
                .map_err(malformed),
            other => Err(DecodeError::UnknownChannel(other.to_string())),
        }
    }
}
