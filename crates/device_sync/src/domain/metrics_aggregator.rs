use common::domain::{Device, Room};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;

/// Summary values derived from the state store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceMetrics {
    pub active_room_id: Option<String>,
    /// Devices switched on in the active room
    pub devices_on: usize,
    /// Devices in the active room
    pub device_count: usize,
    /// Devices switched on across every room
    pub total_devices_on: usize,
}

pub fn derive_metrics(
    rooms: &IndexMap<String, Room>,
    devices: &HashMap<String, Device>,
    active_room: Option<&str>,
) -> DeviceMetrics {
    let total_devices_on = devices.values().filter(|d| d.is_on).count();

    let Some(room) = active_room.and_then(|id| rooms.get(id)) else {
        return DeviceMetrics {
            active_room_id: None,
            devices_on: 0,
            device_count: 0,
            total_devices_on,
        };
    };

    let devices_on = room
        .device_ids
        .iter()
        .filter_map(|id| devices.get(id))
        .filter(|d| d.is_on)
        .count();

    DeviceMetrics {
        active_room_id: Some(room.room_id.clone()),
        devices_on,
        device_count: room.device_ids.len(),
        total_devices_on,
    }
}

/// Holds the last computed [`DeviceMetrics`] and publishes changes.
///
/// Receivers are only woken when a recomputation yields a different value, so
/// idempotent mutations leave no trace on the channel.
#[derive(Debug)]
pub struct MetricsAggregator {
    sender: watch::Sender<DeviceMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(DeviceMetrics::default());
        Self { sender }
    }

    /// Returns true when the derived values changed.
    pub fn recompute(
        &self,
        rooms: &IndexMap<String, Room>,
        devices: &HashMap<String, Device>,
        active_room: Option<&str>,
    ) -> bool {
        let next = derive_metrics(rooms, devices, active_room);
        self.sender.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn current(&self) -> DeviceMetrics {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceMetrics> {
        self.sender.subscribe()
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(on: &[bool]) -> (IndexMap<String, Room>, HashMap<String, Device>) {
        let mut room = Room::new("office", "Office", "");
        let mut devices = HashMap::new();
        for (i, is_on) in on.iter().enumerate() {
            let id = format!("d{i}");
            room.device_ids.push(id.clone());
            devices.insert(
                id.clone(),
                Device {
                    device_id: id,
                    room_id: "office".to_string(),
                    device_type: "Light".to_string(),
                    image_url: String::new(),
                    is_on: *is_on,
                },
            );
        }
        let mut rooms = IndexMap::new();
        rooms.insert("office".to_string(), room);
        (rooms, devices)
    }

    #[test]
    fn test_counts_powered_devices_of_active_room() {
        let (rooms, devices) = fixture(&[true, false, true, true, false]);
        let metrics = derive_metrics(&rooms, &devices, Some("office"));
        assert_eq!(metrics.devices_on, 3);
        assert_eq!(metrics.device_count, 5);
        assert_eq!(metrics.total_devices_on, 3);
    }

    #[test]
    fn test_unknown_active_room_counts_nothing() {
        let (rooms, devices) = fixture(&[true]);
        let metrics = derive_metrics(&rooms, &devices, Some("garage"));
        assert_eq!(metrics.active_room_id, None);
        assert_eq!(metrics.devices_on, 0);
        assert_eq!(metrics.total_devices_on, 1);
    }

    #[tokio::test]
    async fn test_unchanged_recompute_does_not_notify() {
        let (rooms, mut devices) = fixture(&[true, false]);
        let aggregator = MetricsAggregator::new();
        let mut rx = aggregator.subscribe();

        assert!(aggregator.recompute(&rooms, &devices, Some("office")));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!aggregator.recompute(&rooms, &devices, Some("office")));
        assert!(!rx.has_changed().unwrap());

        devices.get_mut("d1").unwrap().is_on = true;
        assert!(aggregator.recompute(&rooms, &devices, Some("office")));
        assert_eq!(rx.borrow_and_update().devices_on, 2);
    }
}
