use crate::domain::{Device, EntityKind, RoomFields, RoomTemperatureSample};
use serde::{Deserialize, Serialize};

/// Row-level change kind reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// Domain representation of a change-feed event
///
/// Events carry no ordering token; they may arrive duplicated or out of order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    DeviceInserted { device: Device },
    DeviceUpdated { device: Device },
    DeviceDeleted { device_id: String },
    RoomInserted { room_id: String, fields: RoomFields },
    RoomUpdated { room_id: String, fields: RoomFields },
    RoomDeleted { room_id: String },
    TemperatureRecorded { sample: RoomTemperatureSample },
}

impl ChangeEvent {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ChangeEvent::DeviceInserted { .. }
            | ChangeEvent::DeviceUpdated { .. }
            | ChangeEvent::DeviceDeleted { .. } => EntityKind::Device,
            ChangeEvent::RoomInserted { .. }
            | ChangeEvent::RoomUpdated { .. }
            | ChangeEvent::RoomDeleted { .. } => EntityKind::Room,
            ChangeEvent::TemperatureRecorded { .. } => EntityKind::TemperatureSample,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            ChangeEvent::DeviceInserted { device } | ChangeEvent::DeviceUpdated { device } => {
                &device.device_id
            }
            ChangeEvent::DeviceDeleted { device_id } => device_id,
            ChangeEvent::RoomInserted { room_id, .. }
            | ChangeEvent::RoomUpdated { room_id, .. }
            | ChangeEvent::RoomDeleted { room_id } => room_id,
            ChangeEvent::TemperatureRecorded { sample } => &sample.room_id,
        }
    }

    pub fn change_kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::DeviceInserted { .. } | ChangeEvent::RoomInserted { .. } => {
                ChangeKind::Inserted
            }
            ChangeEvent::DeviceUpdated { .. }
            | ChangeEvent::RoomUpdated { .. }
            | ChangeEvent::TemperatureRecorded { .. } => ChangeKind::Updated,
            ChangeEvent::DeviceDeleted { .. } | ChangeEvent::RoomDeleted { .. } => {
                ChangeKind::Deleted
            }
        }
    }

    /// Room the event belongs to, when the payload says so. Device deletes only
    /// carry the device identifier.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ChangeEvent::DeviceInserted { device } | ChangeEvent::DeviceUpdated { device } => {
                Some(&device.room_id)
            }
            ChangeEvent::DeviceDeleted { .. } => None,
            ChangeEvent::RoomInserted { room_id, .. }
            | ChangeEvent::RoomUpdated { room_id, .. }
            | ChangeEvent::RoomDeleted { room_id } => Some(room_id),
            ChangeEvent::TemperatureRecorded { sample } => Some(&sample.room_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_event_accessors() {
        let event = ChangeEvent::DeviceUpdated {
            device: Device {
                device_id: "d1".to_string(),
                room_id: "office".to_string(),
                device_type: "Light".to_string(),
                image_url: String::new(),
                is_on: true,
            },
        };

        assert_eq!(event.entity_kind(), EntityKind::Device);
        assert_eq!(event.entity_id(), "d1");
        assert_eq!(event.change_kind(), ChangeKind::Updated);
        assert_eq!(event.room_id(), Some("office"));
    }

    #[test]
    fn test_device_delete_has_no_room() {
        let event = ChangeEvent::DeviceDeleted {
            device_id: "d1".to_string(),
        };
        assert_eq!(event.change_kind(), ChangeKind::Deleted);
        assert_eq!(event.room_id(), None);
    }
}
