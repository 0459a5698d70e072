use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    #[default]
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: DriverStatus,
}

impl Driver {
    /// A driver seen for the first time through a location report.
    pub fn new_at(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            status: DriverStatus::Available,
            ..Self::default()
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == DriverStatus::Available
    }
}
