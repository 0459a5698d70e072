use crate::models::location::SubjectType;

pub const PENDING_ORDERS: &str = "pending_orders";
pub const DRIVERS: &str = "drivers";
pub const ORDER_ASSIGNMENTS: &str = "order_assignments";

pub fn subject_location(subject_type: SubjectType, subject_id: &str) -> String {
    format!("{subject_type}_location:{subject_id}")
}

pub fn order_location(order_id: &str) -> String {
    format!("order_location:{order_id}")
}
