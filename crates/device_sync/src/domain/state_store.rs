use crate::domain::{DeviceMetrics, MetricsAggregator};
use common::domain::{
    DashboardSnapshot, Device, DeviceState, DomainError, DomainResult, EntityRef, Room, RoomFields,
    RoomPatch, RoomTemperatureSample,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

/// Who produced a mutation. The sync engine uses it to reason about precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationSource {
    LocalOptimistic,
    RemoteConfirmed,
}

/// In-memory view of rooms, devices and the latest temperature sample per room.
///
/// Rooms keep insertion order. Every mutation that changes something
/// recomputes the derived metrics before returning. Methods take `&mut self`;
/// the sync engine owns the store and serializes access to it.
#[derive(Debug, Default)]
pub struct StateStore {
    rooms: IndexMap<String, Room>,
    devices: HashMap<String, Device>,
    temperatures: HashMap<String, RoomTemperatureSample>,
    sources: HashMap<EntityRef, MutationSource>,
    active_room: Option<String>,
    aggregator: MetricsAggregator,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Rooms in insertion order. The iterator is `Clone`, so it can be restarted.
    pub fn list_rooms(&self) -> impl Iterator<Item = &Room> + Clone + '_ {
        self.rooms.values()
    }

    /// Devices of a room in the room's order
    pub fn room_devices(&self, room_id: &str) -> DomainResult<Vec<Device>> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| DomainError::RoomNotFound(room_id.to_string()))?;

        Ok(room
            .device_ids
            .iter()
            .filter_map(|id| self.devices.get(id))
            .cloned()
            .collect())
    }

    pub fn temperature(&self, room_id: &str) -> Option<&RoomTemperatureSample> {
        self.temperatures.get(room_id)
    }

    pub fn active_room(&self) -> Option<&str> {
        self.active_room.as_deref()
    }

    pub fn set_active_room(&mut self, room_id: &str) -> DomainResult<()> {
        if !self.rooms.contains_key(room_id) {
            return Err(DomainError::RoomNotFound(room_id.to_string()));
        }
        self.active_room = Some(room_id.to_string());
        self.recompute();
        Ok(())
    }

    pub fn clear_active_room(&mut self) {
        self.active_room = None;
        self.recompute();
    }

    pub fn metrics(&self) -> DeviceMetrics {
        self.aggregator.current()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<DeviceMetrics> {
        self.aggregator.subscribe()
    }

    /// Source of the last mutation applied to an entity
    pub fn source_of(&self, entity: &EntityRef) -> Option<MutationSource> {
        self.sources.get(entity).copied()
    }

    /// Replaces the mutable fields of a known device. Returns whether anything changed.
    pub fn apply_device_state(
        &mut self,
        device_id: &str,
        state: &DeviceState,
        source: MutationSource,
    ) -> DomainResult<bool> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;

        self.sources.insert(EntityRef::device(device_id), source);
        if device.state() == *state {
            return Ok(false);
        }

        *device = device.with_state(state.clone());
        self.recompute();
        Ok(true)
    }

    pub fn apply_room_fields(
        &mut self,
        room_id: &str,
        patch: &RoomPatch,
        source: MutationSource,
    ) -> DomainResult<bool> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DomainError::RoomNotFound(room_id.to_string()))?;

        self.sources.insert(EntityRef::room(room_id), source);
        let patched = patch.apply_to(&room.fields());
        if patched == room.fields() {
            return Ok(false);
        }

        room.name = patched.name;
        room.image_url = patched.image_url;
        self.recompute();
        Ok(true)
    }

    /// Inserts a room, or updates its fields when it already exists.
    pub fn insert_room(&mut self, room_id: &str, fields: RoomFields, source: MutationSource) -> bool {
        if self.rooms.contains_key(room_id) {
            return self
                .apply_room_fields(room_id, &RoomPatch::from(fields), source)
                .unwrap_or(false);
        }

        self.rooms.insert(
            room_id.to_string(),
            Room::new(room_id, fields.name, fields.image_url),
        );
        self.sources.insert(EntityRef::room(room_id), source);
        self.recompute();
        true
    }

    /// Removes a room together with the devices it owns.
    pub fn remove_room(&mut self, room_id: &str) -> Option<(Room, Vec<Device>)> {
        let room = self.rooms.shift_remove(room_id)?;
        self.sources.remove(&EntityRef::room(room_id));

        let devices = room
            .device_ids
            .iter()
            .filter_map(|id| {
                self.sources.remove(&EntityRef::device(id));
                self.devices.remove(id)
            })
            .collect();

        self.temperatures.remove(room_id);
        if self.active_room.as_deref() == Some(room_id) {
            self.active_room = None;
        }
        self.recompute();
        Some((room, devices))
    }

    /// Inserts a device into `room_id`. A device already known in another room
    /// is moved, so it belongs to exactly one room at a time.
    pub fn insert_device(
        &mut self,
        room_id: &str,
        mut device: Device,
        source: MutationSource,
    ) -> DomainResult<bool> {
        if !self.rooms.contains_key(room_id) {
            return Err(DomainError::RoomNotFound(room_id.to_string()));
        }
        device.room_id = room_id.to_string();

        if let Some(existing) = self.devices.get(&device.device_id) {
            if *existing == device {
                self.sources.insert(EntityRef::device(&device.device_id), source);
                return Ok(false);
            }
            if existing.room_id != room_id {
                debug!(device_id = %device.device_id, from = %existing.room_id, to = %room_id, "moving device between rooms");
                let from = existing.room_id.clone();
                if let Some(old_room) = self.rooms.get_mut(&from) {
                    old_room.device_ids.retain(|id| *id != device.device_id);
                }
            }
        }

        if let Some(room) = self.rooms.get_mut(room_id) {
            if !room.owns(&device.device_id) {
                room.device_ids.push(device.device_id.clone());
            }
        }

        self.sources.insert(EntityRef::device(&device.device_id), source);
        self.devices.insert(device.device_id.clone(), device);
        self.recompute();
        Ok(true)
    }

    pub fn remove_device(&mut self, device_id: &str) -> Option<Device> {
        let device = self.devices.remove(device_id)?;
        if let Some(room) = self.rooms.get_mut(&device.room_id) {
            room.device_ids.retain(|id| id != device_id);
        }
        self.sources.remove(&EntityRef::device(device_id));
        self.recompute();
        Some(device)
    }

    /// Keeps only the newest sample per room. Late, older samples are ignored.
    pub fn record_temperature(&mut self, sample: RoomTemperatureSample) -> bool {
        match self.temperatures.get(&sample.room_id) {
            Some(current) if !sample.supersedes(current) => false,
            _ => {
                self.temperatures.insert(sample.room_id.clone(), sample);
                true
            }
        }
    }

    /// Rebuilds the store from a bulk read. The active room survives when it
    /// still exists; otherwise the first room becomes active.
    pub fn replace_all(&mut self, snapshot: DashboardSnapshot) {
        self.rooms.clear();
        self.devices.clear();
        self.temperatures.clear();
        self.sources.clear();

        for record in snapshot.rooms {
            let mut room = Room::new(&record.room_id, record.name, record.image_url);
            self.sources
                .insert(EntityRef::room(&record.room_id), MutationSource::RemoteConfirmed);

            for mut device in record.devices {
                // a stale duplicate from another room loses to the later one
                if let Some(previous) = self.devices.get(&device.device_id) {
                    let previous_room = previous.room_id.clone();
                    if let Some(other) = self.rooms.get_mut(&previous_room) {
                        other.device_ids.retain(|id| *id != device.device_id);
                    }
                }
                device.room_id = record.room_id.clone();
                if !room.owns(&device.device_id) {
                    room.device_ids.push(device.device_id.clone());
                }
                self.sources
                    .insert(EntityRef::device(&device.device_id), MutationSource::RemoteConfirmed);
                self.devices.insert(device.device_id.clone(), device);
            }

            self.rooms.insert(record.room_id, room);
        }

        for sample in snapshot.temperatures {
            self.record_temperature(sample);
        }

        let keep_active = self
            .active_room
            .as_ref()
            .is_some_and(|id| self.rooms.contains_key(id));
        if !keep_active {
            self.active_room = self.rooms.keys().next().cloned();
        }

        self.recompute();
    }

    fn recompute(&mut self) {
        self.aggregator
            .recompute(&self.rooms, &self.devices, self.active_room.as_deref());
    }
}
