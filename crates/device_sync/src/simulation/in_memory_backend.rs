use crate::domain::{DEVICES_TABLE, ROOMS_TABLE, TEMPERATURE_TABLE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{
    CreateDeviceInput, CreateRoomInput, DashboardBackend, DashboardSnapshot, Device, DomainError,
    DomainResult, RoomFields, RoomPatch, RoomRecord, RoomTemperatureSample,
};
use common::realtime::{ChangeFeedMessage, ChangeFeedSource, ChangeFeedSubscription};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

const SUBSCRIPTION_CAPACITY: usize = 1024;

struct Subscriber {
    tables: Vec<String>,
    sender: mpsc::Sender<ChangeFeedMessage>,
}

impl Subscriber {
    fn wants(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }
}

#[derive(Default)]
struct BackendState {
    rooms: IndexMap<String, RoomFields>,
    devices: IndexMap<String, Device>,
    temperatures: HashMap<String, RoomTemperatureSample>,
    subscribers: Vec<Subscriber>,
    failures_remaining: usize,
}

impl BackendState {
    fn emit(&mut self, table: &str, event_type: &str, new: Value, old: Value) {
        let payload = json!({
            "schema": "public",
            "table": table,
            "eventType": event_type,
            "commit_timestamp": Utc::now().to_rfc3339(),
            "new": new,
            "old": old,
        })
        .to_string();

        self.subscribers.retain(|subscriber| {
            if !subscriber.wants(table) {
                return true;
            }
            match subscriber
                .sender
                .try_send(ChangeFeedMessage::new(table, payload.clone()))
            {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(table, "subscriber is lagging, change event lost");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn device_mut(&mut self, device_id: &str) -> DomainResult<&mut Device> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| DomainError::BackendError(format!("no device row {device_id}")))
    }

    fn update_device(&mut self, device_id: &str, f: impl FnOnce(&mut Device)) -> DomainResult<()> {
        let device = self.device_mut(device_id)?;
        f(device);
        let row = device_row(device);
        self.emit(DEVICES_TABLE, "UPDATE", row, json!({ "device_id": device_id }));
        Ok(())
    }
}

/// In-process stand-in for the dashboard backend.
///
/// Stores rows, applies writes and publishes a change event in the realtime
/// wire shape for every row it touches. Tests and demos can inject write
/// failures, hold writes until released and drop every subscription.
pub struct InMemoryDashboardBackend {
    state: Mutex<BackendState>,
    writes_open: watch::Sender<bool>,
}

impl InMemoryDashboardBackend {
    pub fn new() -> Self {
        Self::from_state(BackendState::default())
    }

    pub fn with_snapshot(snapshot: DashboardSnapshot) -> Self {
        let mut state = BackendState::default();
        for record in snapshot.rooms {
            state.rooms.insert(
                record.room_id.clone(),
                RoomFields {
                    name: record.name,
                    image_url: record.image_url,
                },
            );
            for mut device in record.devices {
                device.room_id = record.room_id.clone();
                state.devices.insert(device.device_id.clone(), device);
            }
        }
        for sample in snapshot.temperatures {
            state.temperatures.insert(sample.room_id.clone(), sample);
        }
        Self::from_state(state)
    }

    fn from_state(state: BackendState) -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            state: Mutex::new(state),
            writes_open,
        }
    }

    /// The next `count` writes fail with a backend error.
    pub async fn fail_next_writes(&self, count: usize) {
        self.state.lock().await.failures_remaining = count;
    }

    /// Holds every write until [`resume_writes`](Self::resume_writes) is called.
    pub fn pause_writes(&self) {
        self.writes_open.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.writes_open.send_replace(true);
    }

    /// Closes every open subscription, as if the realtime channel dropped.
    pub async fn drop_subscriptions(&self) {
        let mut state = self.state.lock().await;
        debug!(count = state.subscribers.len(), "dropping change feed subscriptions");
        state.subscribers.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.state.lock().await.devices.get(device_id).cloned()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.state.lock().await.devices.keys().cloned().collect()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.state.lock().await.rooms.keys().cloned().collect()
    }

    /// A write made by another client: bypasses paused writes and injected failures.
    pub async fn set_device_power_remotely(&self, device_id: &str, is_on: bool) -> DomainResult<()> {
        self.state
            .lock()
            .await
            .update_device(device_id, |d| d.is_on = is_on)
    }

    /// Publishes the current row of a device again without changing it.
    pub async fn replay_device(&self, device_id: &str) -> DomainResult<()> {
        self.state.lock().await.update_device(device_id, |_| {})
    }

    pub async fn record_temperature(
        &self,
        room_id: &str,
        temperature: f64,
        humidity: f64,
        recorded_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        if !state.rooms.contains_key(room_id) {
            return Err(DomainError::BackendError(format!("no room row {room_id}")));
        }

        let sample = RoomTemperatureSample {
            room_id: room_id.to_string(),
            temperature,
            humidity,
            recorded_at,
        };
        let row = json!({
            "room_id": sample.room_id,
            "temperature": sample.temperature,
            "humidity": sample.humidity,
            "recorded_at": sample.recorded_at.to_rfc3339(),
        });
        let newest = state
            .temperatures
            .get(room_id)
            .map_or(true, |current| sample.supersedes(current));
        if newest {
            state.temperatures.insert(room_id.to_string(), sample);
        }
        state.emit(TEMPERATURE_TABLE, "INSERT", row, json!({}));
        Ok(())
    }

    /// Waits while writes are paused, then consumes an injected failure if any.
    async fn begin_write(&self, operation: &str) -> DomainResult<tokio::sync::MutexGuard<'_, BackendState>> {
        let mut open = self.writes_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|e| DomainError::BackendError(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(DomainError::BackendError(format!("{operation} rejected")));
        }
        Ok(state)
    }
}

impl Default for InMemoryDashboardBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn device_row(device: &Device) -> Value {
    json!({
        "device_id": device.device_id,
        "room_id": device.room_id,
        "type": device.device_type,
        "image_url": if device.image_url.is_empty() { Value::Null } else { json!(device.image_url) },
        "is_on": device.is_on,
    })
}

fn room_row(room_id: &str, fields: &RoomFields) -> Value {
    json!({
        "id": room_id,
        "name": fields.name,
        "image_url": fields.image_url,
    })
}

#[async_trait]
impl DashboardBackend for InMemoryDashboardBackend {
    async fn fetch_snapshot(&self) -> DomainResult<DashboardSnapshot> {
        let state = self.state.lock().await;
        let rooms = state
            .rooms
            .iter()
            .map(|(room_id, fields)| RoomRecord {
                room_id: room_id.clone(),
                name: fields.name.clone(),
                image_url: fields.image_url.clone(),
                devices: state
                    .devices
                    .values()
                    .filter(|d| d.room_id == *room_id)
                    .cloned()
                    .collect(),
            })
            .collect();

        Ok(DashboardSnapshot {
            rooms,
            temperatures: state.temperatures.values().cloned().collect(),
        })
    }

    async fn set_device_power(&self, device_id: &str, is_on: bool) -> DomainResult<()> {
        let mut state = self.begin_write("set_device_power").await?;
        state.update_device(device_id, |d| d.is_on = is_on)
    }

    async fn set_room_power(&self, room_id: &str, is_on: bool) -> DomainResult<()> {
        let mut state = self.begin_write("set_room_power").await?;
        if !state.rooms.contains_key(room_id) {
            return Err(DomainError::BackendError(format!("no room row {room_id}")));
        }

        let targets: Vec<String> = state
            .devices
            .values()
            .filter(|d| d.room_id == room_id && d.is_on != is_on)
            .map(|d| d.device_id.clone())
            .collect();
        for device_id in targets {
            state.update_device(&device_id, |d| d.is_on = is_on)?;
        }
        Ok(())
    }

    async fn rename_device(&self, device_id: &str, name: &str) -> DomainResult<()> {
        let mut state = self.begin_write("rename_device").await?;
        state.update_device(device_id, |d| d.device_type = name.to_string())
    }

    async fn set_device_image(&self, device_id: &str, image_url: &str) -> DomainResult<()> {
        let mut state = self.begin_write("set_device_image").await?;
        state.update_device(device_id, |d| d.image_url = image_url.to_string())
    }

    async fn create_room(&self, input: CreateRoomInput) -> DomainResult<()> {
        let mut state = self.begin_write("create_room").await?;
        if state.rooms.contains_key(&input.room_id) {
            return Err(DomainError::BackendError(format!(
                "duplicate room id {}",
                input.room_id
            )));
        }

        let fields = RoomFields {
            name: input.name,
            image_url: input.image_url,
        };
        let row = room_row(&input.room_id, &fields);
        state.rooms.insert(input.room_id, fields);
        state.emit(ROOMS_TABLE, "INSERT", row, json!({}));
        Ok(())
    }

    async fn update_room(&self, room_id: &str, patch: RoomPatch) -> DomainResult<()> {
        let mut state = self.begin_write("update_room").await?;
        let fields = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| DomainError::BackendError(format!("no room row {room_id}")))?;

        *fields = patch.apply_to(fields);
        let row = room_row(room_id, fields);
        state.emit(ROOMS_TABLE, "UPDATE", row, json!({ "id": room_id }));
        Ok(())
    }

    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<()> {
        let mut state = self.begin_write("create_device").await?;
        if state.devices.contains_key(&input.device_id) {
            return Err(DomainError::BackendError(format!(
                "duplicate device id {}",
                input.device_id
            )));
        }
        if !state.rooms.contains_key(&input.room_id) {
            return Err(DomainError::BackendError(format!(
                "no room row {}",
                input.room_id
            )));
        }

        let device = Device::from(input);
        let row = device_row(&device);
        state.devices.insert(device.device_id.clone(), device);
        state.emit(DEVICES_TABLE, "INSERT", row, json!({}));
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> DomainResult<()> {
        let mut state = self.begin_write("delete_device").await?;
        let device = state
            .devices
            .shift_remove(device_id)
            .ok_or_else(|| DomainError::BackendError(format!("no device row {device_id}")))?;

        state.emit(DEVICES_TABLE, "DELETE", json!({}), device_row(&device));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryDashboardBackend {
    async fn subscribe(&self, channels: &[String]) -> anyhow::Result<ChangeFeedSubscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.state.lock().await.subscribers.push(Subscriber {
            tables: channels.to_vec(),
            sender,
        });
        Ok(ChangeFeedSubscription::new(receiver))
    }
}
