use crate::domain::{
    ChangeEventDecoder, DeviceMetrics, EntityValue, MutationSource, OperationId, PendingOperation,
    PendingOperationTracker, StateStore, SyncEngineConfig,
};
use common::domain::{
    ChangeEvent, CreateDeviceInput, CreateRoomInput, DashboardBackend, Device, DomainError,
    DomainResult, EntityKind, EntityRef, Room, RoomFields, RoomPatch, RoomTemperatureSample,
    DEFAULT_ROOM_IMAGE,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What the event path did with a change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Applied to the store and changed it
    Applied,
    /// Matched the optimistic value of an in-flight operation
    Confirmed { operation_id: OperationId },
    /// Diverged from an in-flight operation; the remote value won
    Superseded { operation_id: OperationId },
    /// Already reflected in the store
    Unchanged,
    /// Not applied (unobserved room, stale sample)
    Ignored(String),
}

impl EventDisposition {
    pub fn is_ignored(&self) -> bool {
        matches!(self, EventDisposition::Ignored(_))
    }
}

struct SyncState {
    store: StateStore,
    tracker: PendingOperationTracker,
    /// Rooms the user navigated away from; their events are not applied
    left_rooms: HashSet<String>,
}

/// Owns the local dashboard state and serializes every mutation to it.
///
/// Commands and change events are two independent producers. Both take the
/// same lock, so at most one mutation runs at a time. The command path releases
/// the lock while it waits for the backend and re-takes it to commit or roll
/// back.
pub struct SyncEngine {
    backend: Arc<dyn DashboardBackend>,
    decoder: ChangeEventDecoder,
    config: SyncEngineConfig,
    state: Mutex<SyncState>,
    metrics_rx: watch::Receiver<DeviceMetrics>,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn DashboardBackend>, config: SyncEngineConfig) -> Self {
        let store = StateStore::new();
        let metrics_rx = store.subscribe_metrics();
        Self {
            backend,
            decoder: ChangeEventDecoder::new(),
            state: Mutex::new(SyncState {
                store,
                tracker: PendingOperationTracker::new(config.operation_history_capacity),
                left_rooms: HashSet::new(),
            }),
            config,
            metrics_rx,
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Initial bulk read
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> DomainResult<()> {
        self.resync().await?;
        let state = self.state.lock().await;
        info!(
            rooms = state.store.list_rooms().count(),
            active_room = ?state.store.active_room(),
            "dashboard state loaded"
        );
        Ok(())
    }

    /// Full resync: drops every pending operation and rebuilds the store from a bulk read.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        self.resync_locked(&mut state).await
    }

    async fn resync_locked(&self, state: &mut SyncState) -> DomainResult<()> {
        let timeout = self.config.bulk_read_timeout();
        let snapshot = tokio::time::timeout(timeout, self.backend.fetch_snapshot())
            .await
            .map_err(|_| DomainError::BackendError(format!("bulk read timed out after {timeout:?}")))??;

        let discarded = state.tracker.discard_all();
        if discarded > 0 {
            warn!(discarded, "discarded pending operations during resync");
        }

        state.store.replace_all(snapshot);
        let active_is_left = state
            .store
            .active_room()
            .is_some_and(|id| state.left_rooms.contains(id));
        if active_is_left {
            state.store.clear_active_room();
        }

        debug!(rooms = state.store.list_rooms().count(), "store rebuilt from bulk read");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Command path
    // ---------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn set_device_power(&self, device_id: &str, is_on: bool) -> DomainResult<()> {
        let operation_id = {
            let mut state = self.state.lock().await;
            state.begin_power(device_id, Some(is_on))?.0
        };
        self.complete(&[operation_id], self.backend.set_device_power(device_id, is_on))
            .await
    }

    /// Flips the device's current power state. Returns the requested state.
    #[instrument(skip(self))]
    pub async fn toggle_device(&self, device_id: &str) -> DomainResult<bool> {
        let (operation_id, is_on) = {
            let mut state = self.state.lock().await;
            state.begin_power(device_id, None)?
        };
        self.complete(&[operation_id], self.backend.set_device_power(device_id, is_on))
            .await?;
        Ok(is_on)
    }

    #[instrument(skip(self))]
    pub async fn rename_device(&self, device_id: &str, name: &str) -> DomainResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidCommand(
                "device name cannot be empty".to_string(),
            ));
        }

        let operation_id = {
            let mut state = self.state.lock().await;
            let current = state.device_for_command(device_id)?;
            if current.device_type == name {
                return Err(DomainError::InvalidCommand(format!(
                    "device {device_id} is already named {name}"
                )));
            }
            let mut next = current.clone();
            next.device_type = name.to_string();
            state.begin(
                EntityRef::device(device_id),
                EntityValue::Device(current),
                EntityValue::Device(next),
                "rename_device",
            )?
        };
        self.complete(&[operation_id], self.backend.rename_device(device_id, name))
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_device_image(&self, device_id: &str, image_url: &str) -> DomainResult<()> {
        if image_url.trim().is_empty() {
            return Err(DomainError::InvalidCommand(
                "image url cannot be empty".to_string(),
            ));
        }

        let operation_id = {
            let mut state = self.state.lock().await;
            let current = state.device_for_command(device_id)?;
            if current.image_url == image_url {
                return Err(DomainError::InvalidCommand(format!(
                    "device {device_id} already uses this image"
                )));
            }
            let mut next = current.clone();
            next.image_url = image_url.to_string();
            state.begin(
                EntityRef::device(device_id),
                EntityValue::Device(current),
                EntityValue::Device(next),
                "set_device_image",
            )?
        };
        self.complete(
            &[operation_id],
            self.backend.set_device_image(device_id, image_url),
        )
        .await
    }

    /// Creates a room with a locally generated identifier and returns it.
    #[instrument(skip(self))]
    pub async fn create_room(&self, name: &str, image_url: Option<&str>) -> DomainResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidCommand(
                "room name cannot be empty".to_string(),
            ));
        }

        let input = CreateRoomInput {
            room_id: xid::new().to_string(),
            name: name.to_string(),
            image_url: image_url
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(DEFAULT_ROOM_IMAGE)
                .to_string(),
        };

        let operation_id = {
            let mut state = self.state.lock().await;
            state.begin(
                EntityRef::room(&input.room_id),
                EntityValue::Absent,
                EntityValue::Room(RoomFields {
                    name: input.name.clone(),
                    image_url: input.image_url.clone(),
                }),
                "create_room",
            )?
        };

        let room_id = input.room_id.clone();
        self.complete(&[operation_id], self.backend.create_room(input))
            .await?;
        Ok(room_id)
    }

    #[instrument(skip(self))]
    pub async fn update_room(&self, room_id: &str, patch: RoomPatch) -> DomainResult<()> {
        if patch.is_empty() {
            return Err(DomainError::InvalidCommand("room patch is empty".to_string()));
        }
        if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(DomainError::InvalidCommand(
                "room name cannot be empty".to_string(),
            ));
        }

        let operation_id = {
            let mut state = self.state.lock().await;
            let current = state
                .store
                .get_room(room_id)
                .map(Room::fields)
                .ok_or_else(|| DomainError::InvalidCommand(format!("unknown room {room_id}")))?;
            let entity = EntityRef::room(room_id);
            state.tracker.ensure_available(&entity)?;

            let next = patch.apply_to(&current);
            if next == current {
                return Err(DomainError::InvalidCommand(format!(
                    "room {room_id} already has these values"
                )));
            }
            state.begin(
                entity,
                EntityValue::Room(current),
                EntityValue::Room(next),
                "update_room",
            )?
        };
        self.complete(&[operation_id], self.backend.update_room(room_id, patch))
            .await
    }

    /// Adds a device, switched off, to an existing room.
    #[instrument(skip(self), fields(device_id = %input.device_id, room_id = %input.room_id))]
    pub async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<()> {
        if input.device_id.trim().is_empty() {
            return Err(DomainError::InvalidCommand(
                "device id cannot be empty".to_string(),
            ));
        }
        if input.device_type.trim().is_empty() {
            return Err(DomainError::InvalidCommand(
                "device name cannot be empty".to_string(),
            ));
        }

        let operation_id = {
            let mut state = self.state.lock().await;
            if state.store.get_room(&input.room_id).is_none() {
                return Err(DomainError::InvalidCommand(format!(
                    "unknown room {}",
                    input.room_id
                )));
            }
            let entity = EntityRef::device(&input.device_id);
            state.tracker.ensure_available(&entity)?;
            if state.store.get_device(&input.device_id).is_some() {
                return Err(DomainError::InvalidCommand(format!(
                    "device {} already exists",
                    input.device_id
                )));
            }
            state.begin(
                entity,
                EntityValue::Absent,
                EntityValue::Device(Device::from(input.clone())),
                "create_device",
            )?
        };
        self.complete(&[operation_id], self.backend.create_device(input))
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_device(&self, device_id: &str) -> DomainResult<()> {
        let operation_id = {
            let mut state = self.state.lock().await;
            let current = state.device_for_command(device_id)?;
            state.begin(
                EntityRef::device(device_id),
                EntityValue::Device(current),
                EntityValue::Absent,
                "delete_device",
            )?
        };
        self.complete(&[operation_id], self.backend.delete_device(device_id))
            .await
    }

    /// Switches off every powered device of a room as one command. Returns how
    /// many devices were switched off.
    #[instrument(skip(self))]
    pub async fn turn_off_room(&self, room_id: &str) -> DomainResult<usize> {
        let operation_ids = {
            let mut state = self.state.lock().await;
            let powered: Vec<Device> = state
                .store
                .room_devices(room_id)
                .map_err(|_| DomainError::InvalidCommand(format!("unknown room {room_id}")))?
                .into_iter()
                .filter(|d| d.is_on)
                .collect();

            // all or nothing: nothing is mutated when any device is busy
            for device in &powered {
                state
                    .tracker
                    .ensure_available(&EntityRef::device(&device.device_id))?;
            }
            if powered.is_empty() {
                return Err(DomainError::InvalidCommand(format!(
                    "no device is on in room {room_id}"
                )));
            }

            let mut ids = Vec::with_capacity(powered.len());
            for device in powered {
                let mut next = device.clone();
                next.is_on = false;
                ids.push(state.begin(
                    EntityRef::device(&device.device_id),
                    EntityValue::Device(device),
                    EntityValue::Device(next),
                    "turn_off_room",
                )?);
            }
            ids
        };

        let count = operation_ids.len();
        self.complete(&operation_ids, self.backend.set_room_power(room_id, false))
            .await?;
        Ok(count)
    }

    /// Awaits the backend write, bounded by the command timeout, then commits
    /// or rolls back every operation of the command.
    async fn complete<F>(&self, operation_ids: &[OperationId], write: F) -> DomainResult<()>
    where
        F: Future<Output = DomainResult<()>>,
    {
        let timeout = self.config.command_timeout();
        let outcome = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {timeout:?}")),
        };

        let mut state = self.state.lock().await;
        match outcome {
            Ok(()) => {
                for operation_id in operation_ids {
                    state.settle_success(*operation_id);
                }
                Ok(())
            }
            Err(reason) => {
                for operation_id in operation_ids {
                    state.settle_failure(*operation_id, &reason);
                }
                let reason = match operation_ids {
                    [_] => reason,
                    ids => format!("{reason} (operations {ids:?} failed together)"),
                };
                Err(DomainError::CommandFailed {
                    operation_id: operation_ids.first().copied().unwrap_or_default(),
                    reason,
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Event path
    // ---------------------------------------------------------------------

    /// Decodes and applies one raw change-feed payload. Decode errors are
    /// logged and returned; they never affect later events.
    pub async fn ingest(&self, payload: &[u8]) -> DomainResult<EventDisposition> {
        let event = self.decoder.decode(payload).map_err(|e| {
            warn!(error = %e, payload_size = payload.len(), "dropping undecodable change event");
            e
        })?;
        self.apply_event(event).await
    }

    #[instrument(skip(self, event), fields(entity_kind = %event.entity_kind(), entity_id = %event.entity_id(), change = ?event.change_kind()))]
    pub async fn apply_event(&self, event: ChangeEvent) -> DomainResult<EventDisposition> {
        let mut state = self.state.lock().await;

        // deletes apply even to rooms that are no longer observed
        let is_delete = matches!(
            event,
            ChangeEvent::DeviceDeleted { .. } | ChangeEvent::RoomDeleted { .. }
        );
        if !is_delete && !state.is_observed(&event) {
            debug!("event targets a room that is no longer observed");
            return Ok(EventDisposition::Ignored("room not observed".to_string()));
        }

        let disposition = match event {
            ChangeEvent::TemperatureRecorded { sample } => {
                if state.store.record_temperature(sample) {
                    EventDisposition::Applied
                } else {
                    EventDisposition::Ignored("older than the retained sample".to_string())
                }
            }
            ChangeEvent::DeviceDeleted { device_id } => {
                state.discard_silently(&EntityRef::device(&device_id));
                match state.store.remove_device(&device_id) {
                    Some(_) => EventDisposition::Applied,
                    None => EventDisposition::Unchanged,
                }
            }
            ChangeEvent::RoomDeleted { room_id } => {
                state.left_rooms.remove(&room_id);
                let device_ids = state
                    .store
                    .get_room(&room_id)
                    .map(|room| room.device_ids.clone())
                    .unwrap_or_default();
                for device_id in &device_ids {
                    state.discard_silently(&EntityRef::device(device_id));
                }
                state.discard_silently(&EntityRef::room(&room_id));
                match state.store.remove_room(&room_id) {
                    Some(_) => EventDisposition::Applied,
                    None => EventDisposition::Unchanged,
                }
            }
            ChangeEvent::DeviceInserted { device } | ChangeEvent::DeviceUpdated { device } => {
                let entity = EntityRef::device(&device.device_id);
                state.reconcile(entity, EntityValue::Device(device))?
            }
            ChangeEvent::RoomInserted { room_id, fields }
            | ChangeEvent::RoomUpdated { room_id, fields } => {
                state.reconcile(EntityRef::room(&room_id), EntityValue::Room(fields))?
            }
        };

        debug!(disposition = ?disposition, "change event processed");
        Ok(disposition)
    }

    // ---------------------------------------------------------------------
    // Room observation and maintenance
    // ---------------------------------------------------------------------

    /// Makes a room the active one. A room that was left is resynced first.
    #[instrument(skip(self))]
    pub async fn enter_room(&self, room_id: &str) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        if state.left_rooms.contains(room_id) {
            info!("re-entering a left room, resyncing");
            self.resync_locked(&mut state).await?;
            state.left_rooms.remove(room_id);
        }
        state.store.set_active_room(room_id)
    }

    /// Stops observing a room. In-flight operations on it become orphans.
    /// Returns how many operations were orphaned.
    #[instrument(skip(self))]
    pub async fn leave_room(&self, room_id: &str) -> DomainResult<usize> {
        let mut state = self.state.lock().await;
        let device_ids = state
            .store
            .get_room(room_id)
            .map(|room| room.device_ids.clone())
            .ok_or_else(|| DomainError::RoomNotFound(room_id.to_string()))?;

        state.left_rooms.insert(room_id.to_string());

        let mut orphaned = usize::from(state.tracker.mark_orphaned(&EntityRef::room(room_id)));
        for device_id in &device_ids {
            if state.tracker.mark_orphaned(&EntityRef::device(device_id)) {
                orphaned += 1;
            }
        }

        if state.store.active_room() == Some(room_id) {
            state.store.clear_active_room();
        }

        if orphaned > 0 {
            info!(orphaned, "left room with operations in flight");
        }
        Ok(orphaned)
    }

    /// Garbage-collects orphaned operations older than the configured TTL.
    pub async fn collect_stale_operations(&self) -> usize {
        let mut state = self.state.lock().await;
        let stale = state
            .tracker
            .collect_stale(Instant::now(), self.config.pending_operation_ttl());

        for op in &stale {
            warn!(
                operation_id = op.operation_id,
                entity = %op.entity,
                command = op.command,
                orphaned = op.orphaned,
                "garbage collected stale operation"
            );
        }
        stale.len()
    }

    // ---------------------------------------------------------------------
    // Read API
    // ---------------------------------------------------------------------

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.state.lock().await.store.get_device(device_id).cloned()
    }

    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.state.lock().await.store.get_room(room_id).cloned()
    }

    /// Room snapshots in insertion order
    pub async fn rooms(&self) -> Vec<Room> {
        self.state.lock().await.store.list_rooms().cloned().collect()
    }

    pub async fn room_devices(&self, room_id: &str) -> DomainResult<Vec<Device>> {
        self.state.lock().await.store.room_devices(room_id)
    }

    pub async fn temperature(&self, room_id: &str) -> Option<RoomTemperatureSample> {
        self.state.lock().await.store.temperature(room_id).cloned()
    }

    pub async fn active_room(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .store
            .active_room()
            .map(str::to_string)
    }

    pub async fn source_of(&self, entity: &EntityRef) -> Option<MutationSource> {
        self.state.lock().await.store.source_of(entity)
    }

    pub fn metrics(&self) -> DeviceMetrics {
        self.metrics_rx.borrow().clone()
    }

    /// Notified only when the derived values change
    pub fn subscribe_metrics(&self) -> watch::Receiver<DeviceMetrics> {
        self.metrics_rx.clone()
    }

    pub async fn pending_operation(&self, entity: &EntityRef) -> Option<PendingOperation> {
        self.state
            .lock()
            .await
            .tracker
            .find_active_for(entity)
            .cloned()
    }

    pub async fn pending_operation_count(&self) -> usize {
        self.state.lock().await.tracker.active_count()
    }

    /// Recently finished operations, oldest first
    pub async fn operation_history(&self) -> Vec<PendingOperation> {
        self.state.lock().await.tracker.history().cloned().collect()
    }
}

impl SyncState {
    fn device_for_command(&self, device_id: &str) -> DomainResult<Device> {
        let device = self
            .store
            .get_device(device_id)
            .cloned()
            .ok_or_else(|| DomainError::InvalidCommand(format!("unknown device {device_id}")))?;
        self.tracker
            .ensure_available(&EntityRef::device(device_id))?;
        Ok(device)
    }

    /// `None` toggles. Returns the operation and the requested power state.
    fn begin_power(
        &mut self,
        device_id: &str,
        is_on: Option<bool>,
    ) -> DomainResult<(OperationId, bool)> {
        let current = self.device_for_command(device_id)?;
        let is_on = is_on.unwrap_or(!current.is_on);
        if current.is_on == is_on {
            return Err(DomainError::InvalidCommand(format!(
                "device {device_id} is already {}",
                if is_on { "on" } else { "off" }
            )));
        }

        let mut next = current.clone();
        next.is_on = is_on;
        let operation_id = self.begin(
            EntityRef::device(device_id),
            EntityValue::Device(current),
            EntityValue::Device(next),
            "set_device_power",
        )?;
        Ok((operation_id, is_on))
    }

    /// Records the operation and applies its optimistic value.
    fn begin(
        &mut self,
        entity: EntityRef,
        previous: EntityValue,
        optimistic: EntityValue,
        command: &'static str,
    ) -> DomainResult<OperationId> {
        let operation_id =
            self.tracker
                .begin(entity.clone(), previous, optimistic.clone(), command)?;

        if let Err(e) = self.apply_value(&entity, optimistic, MutationSource::LocalOptimistic) {
            let _ = self.tracker.discard(operation_id);
            return Err(e);
        }
        Ok(operation_id)
    }

    fn settle_success(&mut self, operation_id: OperationId) {
        match self.tracker.get_active(operation_id) {
            None => debug!(operation_id, "operation already resolved by a change event"),
            Some(op) if op.orphaned => {
                debug!(operation_id, "write confirmed for an orphaned operation")
            }
            Some(_) => {
                if let Ok(op) = self.tracker.commit(operation_id) {
                    info!(operation_id, entity = %op.entity, command = op.command, "operation confirmed");
                }
            }
        }
    }

    fn settle_failure(&mut self, operation_id: OperationId, reason: &str) {
        let entity = match self.tracker.get_active(operation_id) {
            None => {
                debug!(operation_id, reason, "write failed after the operation was resolved");
                return;
            }
            Some(op) if op.orphaned => {
                debug!(operation_id, reason, "write failed for an orphaned operation");
                return;
            }
            Some(op) => op.entity.clone(),
        };

        let previous = match self.tracker.rollback(operation_id) {
            Ok(previous) => previous,
            Err(_) => return,
        };
        warn!(operation_id, entity = %entity, reason, "write failed, rolling back");

        if let Err(e) = self.apply_value(&entity, previous, MutationSource::RemoteConfirmed) {
            warn!(operation_id, entity = %entity, error = %e, "rollback could not restore previous value");
        }
    }

    /// Applies a remote value, resolving an in-flight operation on the same entity.
    fn reconcile(&mut self, entity: EntityRef, remote: EntityValue) -> DomainResult<EventDisposition> {
        let pending = self
            .tracker
            .find_active_for(&entity)
            .map(|op| (op.operation_id, op.is_confirmed_by(&remote)));

        let changed = self.apply_value(&entity, remote, MutationSource::RemoteConfirmed)?;

        let disposition = match pending {
            Some((operation_id, true)) => {
                self.tracker.commit(operation_id)?;
                info!(operation_id, entity = %entity, "operation confirmed by change event");
                EventDisposition::Confirmed { operation_id }
            }
            Some((operation_id, false)) => {
                self.tracker.supersede(operation_id)?;
                warn!(operation_id, entity = %entity, "change event diverged from optimistic value, remote wins");
                EventDisposition::Superseded { operation_id }
            }
            None if changed => EventDisposition::Applied,
            None => EventDisposition::Unchanged,
        };
        Ok(disposition)
    }

    fn discard_silently(&mut self, entity: &EntityRef) {
        if let Some(op) = self.tracker.discard_for(entity) {
            debug!(operation_id = op.operation_id, entity = %entity, "target deleted, operation discarded");
        }
    }

    fn apply_value(
        &mut self,
        entity: &EntityRef,
        value: EntityValue,
        source: MutationSource,
    ) -> DomainResult<bool> {
        match (entity.kind, value) {
            (EntityKind::Device, EntityValue::Device(device)) => {
                let same_room = self
                    .store
                    .get_device(&device.device_id)
                    .is_some_and(|d| d.room_id == device.room_id);
                if same_room {
                    return self
                        .store
                        .apply_device_state(&device.device_id, &device.state(), source);
                }

                let room_id = device.room_id.clone();
                if self.store.get_room(&room_id).is_none() {
                    if source == MutationSource::LocalOptimistic {
                        return Err(DomainError::RoomNotFound(room_id));
                    }
                    warn!(device_id = %device.device_id, room_id = %room_id, "device references an unknown room, adding placeholder");
                    self.store.insert_room(
                        &room_id,
                        RoomFields {
                            name: room_id.clone(),
                            image_url: DEFAULT_ROOM_IMAGE.to_string(),
                        },
                        source,
                    );
                }
                self.store.insert_device(&room_id, device, source)
            }
            (EntityKind::Device, EntityValue::Absent) => {
                Ok(self.store.remove_device(&entity.id).is_some())
            }
            (EntityKind::Room, EntityValue::Room(fields)) => {
                Ok(self.store.insert_room(&entity.id, fields, source))
            }
            (EntityKind::Room, EntityValue::Absent) => Ok(self.store.remove_room(&entity.id).is_some()),
            (kind, value) => Err(DomainError::InvalidCommand(format!(
                "{value:?} cannot be applied to a {kind}"
            ))),
        }
    }

    fn is_observed(&self, event: &ChangeEvent) -> bool {
        if self.left_rooms.is_empty() {
            return true;
        }

        let current_room = match event.entity_kind() {
            EntityKind::Device => self
                .store
                .get_device(event.entity_id())
                .map(|d| d.room_id.as_str()),
            _ => None,
        };

        let rooms: Vec<&str> = event.room_id().into_iter().chain(current_room).collect();
        rooms.is_empty() || rooms.iter().any(|id| !self.left_rooms.contains(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{DashboardSnapshot, MockDashboardBackend, RoomRecord};
    use serde_json::json;

    fn device(id: &str, room_id: &str, is_on: bool) -> Device {
        Device {
            device_id: id.to_string(),
            room_id: room_id.to_string(),
            device_type: format!("Light {id}"),
            image_url: String::new(),
            is_on,
        }
    }

    fn snapshot() -> DashboardSnapshot {
        DashboardSnapshot {
            rooms: vec![
                RoomRecord {
                    room_id: "office".to_string(),
                    name: "Office".to_string(),
                    image_url: "/img/office.jpg".to_string(),
                    devices: vec![device("d1", "office", false), device("d2", "office", true)],
                },
                RoomRecord {
                    room_id: "living".to_string(),
                    name: "Living Room".to_string(),
                    image_url: "/img/living.jpg".to_string(),
                    devices: vec![device("tv", "living", false)],
                },
            ],
            temperatures: vec![],
        }
    }

    async fn engine_with(mut backend: MockDashboardBackend) -> SyncEngine {
        let snap = snapshot();
        backend
            .expect_fetch_snapshot()
            .returning(move || Ok(snap.clone()));
        let engine = SyncEngine::new(Arc::new(backend), SyncEngineConfig::default());
        engine.initialize().await.unwrap();
        engine
    }

    fn device_update(id: &str, room_id: &str, is_on: bool) -> Vec<u8> {
        json!({
            "table": "devices",
            "eventType": "UPDATE",
            "new": {
                "device_id": id,
                "room_id": room_id,
                "type": format!("Light {id}"),
                "image_url": null,
                "is_on": is_on
            },
            "old": {}
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_set_device_power_commits_on_success() {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_set_device_power()
            .withf(|id: &str, on: &bool| id == "d1" && *on)
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = engine_with(backend).await;

        engine.set_device_power("d1", true).await.unwrap();

        assert!(engine.device("d1").await.unwrap().is_on);
        assert_eq!(engine.metrics().devices_on, 2);
        assert_eq!(engine.pending_operation_count().await, 0);
        let history = engine.operation_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, crate::domain::OperationState::Committed);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_set_device_power()
            .returning(|_, _| Err(DomainError::BackendError("device offline".to_string())));
        let engine = engine_with(backend).await;

        let err = engine.set_device_power("d1", true).await.unwrap_err();

        match err {
            DomainError::CommandFailed { reason, .. } => assert!(reason.contains("device offline")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!engine.device("d1").await.unwrap().is_on);
        assert_eq!(engine.metrics().devices_on, 1);
        assert_eq!(
            engine.source_of(&EntityRef::device("d1")).await,
            Some(MutationSource::RemoteConfirmed)
        );
    }

    #[tokio::test]
    async fn test_invalid_commands_have_no_side_effects() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        assert!(matches!(
            engine.set_device_power("ghost", true).await,
            Err(DomainError::InvalidCommand(_))
        ));
        assert!(matches!(
            engine.set_device_power("d2", true).await,
            Err(DomainError::InvalidCommand(_))
        ));
        assert!(matches!(
            engine.rename_device("d1", "   ").await,
            Err(DomainError::InvalidCommand(_))
        ));
        assert!(matches!(
            engine.update_room("office", RoomPatch::default()).await,
            Err(DomainError::InvalidCommand(_))
        ));
        assert!(matches!(
            engine.turn_off_room("living").await,
            Err(DomainError::InvalidCommand(_))
        ));
        assert_eq!(engine.operation_history().await.len(), 0);
    }

    #[tokio::test]
    async fn test_create_room_uses_default_image() {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_create_room()
            .withf(|input: &CreateRoomInput| {
                input.name == "Garage" && input.image_url == DEFAULT_ROOM_IMAGE
            })
            .returning(|_| Ok(()));
        let engine = engine_with(backend).await;

        let room_id = engine.create_room(" Garage ", None).await.unwrap();

        let room = engine.room(&room_id).await.unwrap();
        assert_eq!(room.name, "Garage");
        let names: Vec<_> = engine.rooms().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Office", "Living Room", "Garage"]);
    }

    #[tokio::test]
    async fn test_failed_create_device_removes_optimistic_insert() {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_create_device()
            .returning(|_| Err(DomainError::BackendError("duplicate key".to_string())));
        let engine = engine_with(backend).await;

        let result = engine
            .create_device(CreateDeviceInput {
                device_id: "fan".to_string(),
                room_id: "office".to_string(),
                device_type: "Fan".to_string(),
                image_url: String::new(),
            })
            .await;

        assert!(matches!(result, Err(DomainError::CommandFailed { .. })));
        assert!(engine.device("fan").await.is_none());
        assert!(!engine.room("office").await.unwrap().owns("fan"));
    }

    #[tokio::test]
    async fn test_turn_off_room_switches_off_powered_devices() {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_set_room_power()
            .withf(|room_id: &str, on: &bool| room_id == "office" && !*on)
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = engine_with(backend).await;

        let count = engine.turn_off_room("office").await.unwrap();

        assert_eq!(count, 1);
        assert!(!engine.device("d2").await.unwrap().is_on);
        assert_eq!(engine.metrics().devices_on, 0);
    }

    #[tokio::test]
    async fn test_remote_update_without_pending_operation() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        let first = engine.ingest(&device_update("d1", "office", true)).await.unwrap();
        let second = engine.ingest(&device_update("d1", "office", true)).await.unwrap();

        assert_eq!(first, EventDisposition::Applied);
        assert_eq!(second, EventDisposition::Unchanged);
        assert_eq!(engine.metrics().devices_on, 2);
    }

    #[tokio::test]
    async fn test_unknown_device_is_inserted() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        let disposition = engine
            .ingest(&device_update("lamp", "living", true))
            .await
            .unwrap();

        assert_eq!(disposition, EventDisposition::Applied);
        assert_eq!(engine.device("lamp").await.unwrap().room_id, "living");
        assert!(engine.room("living").await.unwrap().owns("lamp"));
    }

    #[tokio::test]
    async fn test_device_in_unknown_room_gets_placeholder_room() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        engine
            .ingest(&device_update("car", "garage", false))
            .await
            .unwrap();

        let room = engine.room("garage").await.unwrap();
        assert_eq!(room.name, "garage");
        assert_eq!(room.device_ids, vec!["car".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_error_does_not_stall_event_path() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        assert!(matches!(
            engine.ingest(b"{\"table\":\"devices\"}").await,
            Err(DomainError::DecodeError(_))
        ));
        assert_eq!(
            engine.ingest(&device_update("d1", "office", true)).await.unwrap(),
            EventDisposition::Applied
        );
    }

    #[tokio::test]
    async fn test_room_delete_removes_devices() {
        let engine = engine_with(MockDashboardBackend::new()).await;

        let payload = json!({
            "table": "rooms",
            "eventType": "DELETE",
            "old": { "id": "office" }
        })
        .to_string();
        engine.ingest(payload.as_bytes()).await.unwrap();

        assert!(engine.room("office").await.is_none());
        assert!(engine.device("d2").await.is_none());
        assert_eq!(engine.active_room().await, None);
        assert_eq!(engine.metrics().total_devices_on, 0);
    }

    #[tokio::test]
    async fn test_left_room_events_are_ignored() {
        let engine = engine_with(MockDashboardBackend::new()).await;
        engine.leave_room("living").await.unwrap();

        let disposition = engine
            .ingest(&device_update("tv", "living", true))
            .await
            .unwrap();

        assert!(disposition.is_ignored());
        assert!(!engine.device("tv").await.unwrap().is_on);

        engine.enter_room("living").await.unwrap();
        assert_eq!(
            engine.ingest(&device_update("tv", "living", true)).await.unwrap(),
            EventDisposition::Applied
        );
        assert_eq!(engine.metrics().active_room_id.as_deref(), Some("living"));
        assert_eq!(engine.metrics().devices_on, 1);
    }

    #[tokio::test]
    async fn test_delete_of_left_room_still_applies() {
        let engine = engine_with(MockDashboardBackend::new()).await;
        engine.leave_room("living").await.unwrap();

        let payload = json!({
            "table": "rooms",
            "eventType": "DELETE",
            "old": { "id": "living" }
        })
        .to_string();
        let disposition = engine.ingest(payload.as_bytes()).await.unwrap();

        assert_eq!(disposition, EventDisposition::Applied);
        assert!(engine.room("living").await.is_none());
        assert!(engine.device("tv").await.is_none());
        assert!(matches!(
            engine.enter_room("living").await,
            Err(DomainError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enter_unknown_room() {
        let engine = engine_with(MockDashboardBackend::new()).await;
        assert!(matches!(
            engine.enter_room("attic").await,
            Err(DomainError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_temperature_is_ignored() {
        let engine = engine_with(MockDashboardBackend::new()).await;
        let sample = |temperature: f64, at: &str| {
            json!({
                "table": "temperature_data",
                "eventType": "INSERT",
                "new": {
                    "room_id": "office",
                    "temperature": temperature,
                    "humidity": 45.0,
                    "recorded_at": at
                }
            })
            .to_string()
        };

        engine
            .ingest(sample(22.0, "2024-01-01T12:00:00Z").as_bytes())
            .await
            .unwrap();
        let late = engine
            .ingest(sample(18.0, "2024-01-01T11:00:00Z").as_bytes())
            .await
            .unwrap();

        assert!(late.is_ignored());
        assert_eq!(engine.temperature("office").await.unwrap().temperature, 22.0);
    }
}
