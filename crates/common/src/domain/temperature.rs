use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A temperature/humidity reading for a room. Only the newest sample per room is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomTemperatureSample {
    pub room_id: String,
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity, percent
    pub humidity: f64,
    pub recorded_at: DateTime<Utc>,
}

impl RoomTemperatureSample {
    /// True when `self` should replace `current` (strictly newer).
    pub fn supersedes(&self, current: &RoomTemperatureSample) -> bool {
        self.recorded_at > current.recorded_at
    }
}
