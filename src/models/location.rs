use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Driver,
    Customer,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Driver => "driver",
            SubjectType::Customer => "customer",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A location report for one subject, as carried on `location_updates`.
///
/// `userId`/`userType` are accepted on input for clients still speaking the
/// older field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(alias = "userId")]
    pub subject_id: String,
    #[serde(alias = "userType")]
    pub subject_type: SubjectType,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl LocationUpdate {
    /// Order id if present and non-empty.
    pub fn active_order(&self) -> Option<&str> {
        self.order_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn with_default_timestamp(mut self) -> Self {
        if self.location.timestamp == 0 {
            self.location.timestamp = Utc::now().timestamp();
        }
        self
    }
}
