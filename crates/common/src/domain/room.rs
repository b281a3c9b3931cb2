use crate::domain::{Device, RoomTemperatureSample};
use serde::{Deserialize, Serialize};

/// Image used for rooms created without one
pub const DEFAULT_ROOM_IMAGE: &str = "/images/default-room.jpg";

/// A room and the identifiers of the devices it owns, in insertion order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub name: String,
    pub image_url: String,
    pub device_ids: Vec<String>,
}

impl Room {
    pub fn new(room_id: impl Into<String>, name: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            name: name.into(),
            image_url: image_url.into(),
            device_ids: Vec::new(),
        }
    }

    pub fn fields(&self) -> RoomFields {
        RoomFields {
            name: self.name.clone(),
            image_url: self.image_url.clone(),
        }
    }

    pub fn owns(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|id| id == device_id)
    }
}

/// The mutable fields of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFields {
    pub name: String,
    pub image_url: String,
}

/// Partial update of a room; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub image_url: Option<String>,
}

impl RoomPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.image_url.is_none()
    }

    pub fn apply_to(&self, fields: &RoomFields) -> RoomFields {
        RoomFields {
            name: self.name.clone().unwrap_or_else(|| fields.name.clone()),
            image_url: self
                .image_url
                .clone()
                .unwrap_or_else(|| fields.image_url.clone()),
        }
    }
}

impl From<RoomFields> for RoomPatch {
    fn from(fields: RoomFields) -> Self {
        Self {
            name: Some(fields.name),
            image_url: Some(fields.image_url),
        }
    }
}

/// Input for creating a room. The identifier is generated locally so the
/// optimistic insert and the backend row share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRoomInput {
    pub room_id: String,
    pub name: String,
    pub image_url: String,
}

/// A room with its devices nested, as returned by the bulk read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: String,
    pub name: String,
    pub image_url: String,
    pub devices: Vec<Device>,
}

/// Result of the backend bulk read: every room with nested devices plus the
/// latest temperature sample of each room that has one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardSnapshot {
    pub rooms: Vec<RoomRecord>,
    pub temperatures: Vec<RoomTemperatureSample>,
}
