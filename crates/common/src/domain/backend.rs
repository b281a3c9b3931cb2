use crate::domain::{CreateDeviceInput, CreateRoomInput, DashboardSnapshot, DomainResult, RoomPatch};
use async_trait::async_trait;

/// Request/response channel to the backend-as-a-service that owns the rows.
/// The sync engine calls through this trait for the bulk read and every write;
/// the change feed is a separate channel (see `realtime::ChangeFeedSource`).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DashboardBackend: Send + Sync {
    /// Current rooms with nested devices and the latest temperature per room
    async fn fetch_snapshot(&self) -> DomainResult<DashboardSnapshot>;

    async fn set_device_power(&self, device_id: &str, is_on: bool) -> DomainResult<()>;

    /// Sets the power state of every device in a room in one write
    async fn set_room_power(&self, room_id: &str, is_on: bool) -> DomainResult<()>;

    async fn rename_device(&self, device_id: &str, device_type: &str) -> DomainResult<()>;

    async fn set_device_image(&self, device_id: &str, image_url: &str) -> DomainResult<()>;

    async fn create_room(&self, input: CreateRoomInput) -> DomainResult<()>;

    async fn update_room(&self, room_id: &str, patch: RoomPatch) -> DomainResult<()>;

    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<()>;

    async fn delete_device(&self, device_id: &str) -> DomainResult<()>;
}
