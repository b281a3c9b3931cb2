use crate::domain::{EntityValue, OperationId, OperationState, PendingOperation};
use common::domain::{DomainError, DomainResult, EntityRef};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Records in-flight commands, at most one per entity.
///
/// Finished operations move into a bounded history kept for diagnostics.
#[derive(Debug)]
pub struct PendingOperationTracker {
    next_id: OperationId,
    active: HashMap<EntityRef, PendingOperation>,
    by_id: HashMap<OperationId, EntityRef>,
    history: VecDeque<PendingOperation>,
    history_capacity: usize,
}

impl PendingOperationTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            next_id: 1,
            active: HashMap::new(),
            by_id: HashMap::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
        }
    }

    /// Fails with `ConflictingOperation` when the entity already has an active operation.
    pub fn ensure_available(&self, entity: &EntityRef) -> DomainResult<()> {
        match self.active.get(entity) {
            Some(op) => Err(DomainError::ConflictingOperation {
                entity: entity.clone(),
                operation_id: op.operation_id,
            }),
            None => Ok(()),
        }
    }

    pub fn begin(
        &mut self,
        entity: EntityRef,
        previous: EntityValue,
        optimistic: EntityValue,
        command: &'static str,
    ) -> DomainResult<OperationId> {
        self.ensure_available(&entity)?;

        let operation_id = self.next_id;
        self.next_id += 1;

        debug!(operation_id, entity = %entity, command, "operation started");
        self.by_id.insert(operation_id, entity.clone());
        self.active.insert(
            entity.clone(),
            PendingOperation {
                operation_id,
                entity,
                previous,
                optimistic,
                state: OperationState::InFlight,
                created_at: Instant::now(),
                orphaned: false,
                command,
            },
        );
        Ok(operation_id)
    }

    pub fn commit(&mut self, operation_id: OperationId) -> DomainResult<PendingOperation> {
        self.finish(operation_id, OperationState::Committed)
    }

    /// Finishes the operation and returns the value to restore.
    pub fn rollback(&mut self, operation_id: OperationId) -> DomainResult<EntityValue> {
        self.finish(operation_id, OperationState::RolledBack)
            .map(|op| op.previous)
    }

    pub fn supersede(&mut self, operation_id: OperationId) -> DomainResult<PendingOperation> {
        self.finish(operation_id, OperationState::Superseded)
    }

    pub fn discard(&mut self, operation_id: OperationId) -> DomainResult<PendingOperation> {
        self.finish(operation_id, OperationState::Discarded)
    }

    pub fn discard_for(&mut self, entity: &EntityRef) -> Option<PendingOperation> {
        let operation_id = self.active.get(entity)?.operation_id;
        self.discard(operation_id).ok()
    }

    /// Discards every active operation. Returns how many were dropped.
    pub fn discard_all(&mut self) -> usize {
        let ids: Vec<OperationId> = self.by_id.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.discard(*id).is_ok())
            .count()
    }

    pub fn find_active_for(&self, entity: &EntityRef) -> Option<&PendingOperation> {
        self.active.get(entity)
    }

    pub fn get_active(&self, operation_id: OperationId) -> Option<&PendingOperation> {
        self.by_id
            .get(&operation_id)
            .and_then(|entity| self.active.get(entity))
    }

    pub fn is_active(&self, operation_id: OperationId) -> bool {
        self.by_id.contains_key(&operation_id)
    }

    /// Flags the entity's active operation as orphaned. Orphaned operations
    /// are neither committed nor rolled back; they wait for garbage collection.
    pub fn mark_orphaned(&mut self, entity: &EntityRef) -> bool {
        match self.active.get_mut(entity) {
            Some(op) => {
                op.orphaned = true;
                true
            }
            None => false,
        }
    }

    /// Discards orphaned operations older than `ttl` and returns them.
    /// Operations still awaiting their write are settled by the command path.
    pub fn collect_stale(&mut self, now: Instant, ttl: Duration) -> Vec<PendingOperation> {
        let stale: Vec<OperationId> = self
            .active
            .values()
            .filter(|op| op.orphaned && op.age(now) >= ttl)
            .map(|op| op.operation_id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.discard(id).ok())
            .collect()
    }

    /// Finished operations, oldest first
    pub fn history(&self) -> impl Iterator<Item = &PendingOperation> + '_ {
        self.history.iter()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn finish(
        &mut self,
        operation_id: OperationId,
        state: OperationState,
    ) -> DomainResult<PendingOperation> {
        let entity = self
            .by_id
            .remove(&operation_id)
            .ok_or(DomainError::OperationNotFound(operation_id))?;
        let mut op = self
            .active
            .remove(&entity)
            .ok_or(DomainError::OperationNotFound(operation_id))?;

        op.state = state;
        debug!(operation_id, entity = %op.entity, state = state.as_str(), "operation finished");

        if self.history_capacity > 0 {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(op.clone());
        }
        Ok(op)
    }
}

impl Default for PendingOperationTracker {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::RoomFields;

    fn room_value(name: &str) -> EntityValue {
        EntityValue::Room(RoomFields {
            name: name.to_string(),
            image_url: String::new(),
        })
    }

    #[test]
    fn test_second_operation_on_same_entity_conflicts() {
        let mut tracker = PendingOperationTracker::default();
        let entity = EntityRef::room("office");

        let first = tracker
            .begin(entity.clone(), room_value("Office"), room_value("Study"), "update_room")
            .unwrap();
        let err = tracker
            .begin(entity.clone(), room_value("Study"), room_value("Den"), "update_room")
            .unwrap_err();

        match err {
            DomainError::ConflictingOperation { operation_id, .. } => assert_eq!(operation_id, first),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_ids_increase_and_rollback_returns_previous() {
        let mut tracker = PendingOperationTracker::default();
        let a = tracker
            .begin(EntityRef::room("a"), room_value("A"), room_value("A2"), "update_room")
            .unwrap();
        let b = tracker
            .begin(EntityRef::room("b"), room_value("B"), room_value("B2"), "update_room")
            .unwrap();
        assert!(b > a);

        assert_eq!(tracker.rollback(a).unwrap(), room_value("A"));
        assert!(tracker.find_active_for(&EntityRef::room("a")).is_none());
        assert!(matches!(
            tracker.rollback(a),
            Err(DomainError::OperationNotFound(id)) if id == a
        ));

        let committed = tracker.commit(b).unwrap();
        assert_eq!(committed.state, OperationState::Committed);
        let states: Vec<_> = tracker.history().map(|op| op.state).collect();
        assert_eq!(states, vec![OperationState::RolledBack, OperationState::Committed]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = PendingOperationTracker::new(2);
        for i in 0..5 {
            let id = tracker
                .begin(EntityRef::room(format!("r{i}")), EntityValue::Absent, room_value("R"), "create_room")
                .unwrap();
            tracker.commit(id).unwrap();
        }

        let ids: Vec<_> = tracker.history().map(|op| op.operation_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_stale_discards_old_operations() {
        let mut tracker = PendingOperationTracker::default();
        let old = tracker
            .begin(EntityRef::room("old"), room_value("Old"), room_value("Older"), "update_room")
            .unwrap();
        tracker.mark_orphaned(&EntityRef::room("old"));

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker
            .begin(EntityRef::room("new"), room_value("New"), room_value("Newer"), "update_room")
            .unwrap();

        let stale = tracker.collect_stale(Instant::now(), Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].operation_id, old);
        assert!(stale[0].orphaned);
        assert_eq!(stale[0].state, OperationState::Discarded);
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_stale_keeps_operations_still_awaiting_their_write() {
        let mut tracker = PendingOperationTracker::default();
        let live = tracker
            .begin(EntityRef::room("slow"), room_value("Slow"), room_value("Slower"), "update_room")
            .unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;

        assert!(tracker
            .collect_stale(Instant::now(), Duration::from_secs(60))
            .is_empty());
        assert!(tracker.is_active(live));
    }

    #[test]
    fn test_discard_all() {
        let mut tracker = PendingOperationTracker::default();
        tracker
            .begin(EntityRef::room("a"), room_value("A"), room_value("A2"), "update_room")
            .unwrap();
        tracker
            .begin(EntityRef::device("d1"), EntityValue::Absent, room_value("x"), "create_device")
            .unwrap();

        assert_eq!(tracker.discard_all(), 2);
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.ensure_available(&EntityRef::device("d1")).is_ok());
    }
}
