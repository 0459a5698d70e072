use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderAssignment {
    pub order_id: String,
    pub driver_id: String,
    pub assigned_at: DateTime<Utc>,
}

impl OrderAssignment {
    pub fn new(order_id: impl Into<String>, driver_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            driver_id: driver_id.into(),
            assigned_at: Utc::now(),
        }
    }
}
