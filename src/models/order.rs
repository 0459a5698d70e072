use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_CANCELLED: &str = "cancelled";

/// `true` for statuses that end an order's active assignment.
pub fn is_terminal_status(status: &str) -> bool {
    status == STATUS_DELIVERED || status == STATUS_CANCELLED
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub restaurant_id: String,
    pub user_id: String,
    pub status: String,
    pub delivery_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_delivery_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdate {
    pub order_id: String,
    pub status: String,
}

impl OrderStatusUpdate {
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }
}
