use common::domain::{Device, EntityRef, RoomFields};
use tokio::time::Instant;

/// Locally generated, strictly increasing
pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    InFlight,
    Committed,
    RolledBack,
    /// A diverging change event replaced the optimistic value
    Superseded,
    /// The target was deleted, resynced or garbage collected
    Discarded,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::InFlight => "in_flight",
            OperationState::Committed => "committed",
            OperationState::RolledBack => "rolled_back",
            OperationState::Superseded => "superseded",
            OperationState::Discarded => "discarded",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, OperationState::InFlight)
    }
}

/// Value of an entity before or after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityValue {
    Absent,
    Device(Device),
    Room(RoomFields),
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub operation_id: OperationId,
    pub entity: EntityRef,
    /// Restored on rollback
    pub previous: EntityValue,
    pub optimistic: EntityValue,
    pub state: OperationState,
    pub created_at: Instant,
    /// The entity's room is no longer observed; the operation is left for garbage collection.
    pub orphaned: bool,
    /// Command that created the operation (`set_device_power`, `create_room`, ...)
    pub command: &'static str,
}

impl PendingOperation {
    /// Whether a remote value confirms this operation.
    ///
    /// Only the fields the command changed are compared, so a remote write to
    /// an unrelated field does not turn a confirmation into a divergence.
    pub fn is_confirmed_by(&self, remote: &EntityValue) -> bool {
        match (&self.previous, &self.optimistic, remote) {
            (EntityValue::Device(before), EntityValue::Device(after), EntityValue::Device(remote)) => {
                (before.is_on == after.is_on || after.is_on == remote.is_on)
                    && (before.device_type == after.device_type
                        || after.device_type == remote.device_type)
                    && (before.image_url == after.image_url || after.image_url == remote.image_url)
                    && (before.room_id == after.room_id || after.room_id == remote.room_id)
            }
            (EntityValue::Room(before), EntityValue::Room(after), EntityValue::Room(remote)) => {
                (before.name == after.name || after.name == remote.name)
                    && (before.image_url == after.image_url || after.image_url == remote.image_url)
            }
            (_, optimistic, remote) => optimistic == remote,
        }
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(is_on: bool) -> Device {
        Device {
            device_id: "d1".to_string(),
            room_id: "office".to_string(),
            device_type: "Light".to_string(),
            image_url: String::new(),
            is_on,
        }
    }

    fn operation(previous: EntityValue, optimistic: EntityValue) -> PendingOperation {
        PendingOperation {
            operation_id: 1,
            entity: EntityRef::device("d1"),
            previous,
            optimistic,
            state: OperationState::InFlight,
            created_at: Instant::now(),
            orphaned: false,
            command: "set_device_power",
        }
    }

    #[test]
    fn test_confirmation_compares_changed_fields_only() {
        let op = operation(
            EntityValue::Device(light(false)),
            EntityValue::Device(light(true)),
        );

        let mut renamed_remotely = light(true);
        renamed_remotely.device_type = "Desk Lamp".to_string();
        assert!(op.is_confirmed_by(&EntityValue::Device(renamed_remotely)));
        assert!(!op.is_confirmed_by(&EntityValue::Device(light(false))));
    }

    #[test]
    fn test_confirmation_of_insert_requires_full_match() {
        let op = operation(EntityValue::Absent, EntityValue::Device(light(false)));
        assert!(op.is_confirmed_by(&EntityValue::Device(light(false))));
        assert!(!op.is_confirmed_by(&EntityValue::Device(light(true))));
    }

    #[test]
    fn test_delete_is_confirmed_by_absence() {
        let op = operation(EntityValue::Device(light(true)), EntityValue::Absent);
        assert!(op.is_confirmed_by(&EntityValue::Absent));
        assert!(!op.is_confirmed_by(&EntityValue::Device(light(true))));
    }
}
