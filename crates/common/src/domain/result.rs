use crate::domain::EntityRef;
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    /// Rejected before any mutation: unknown target, empty input or a no-op value.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A command is already in flight for the same entity.
    #[error("Conflicting operation: {entity} already has operation {operation_id} in flight")]
    ConflictingOperation { entity: EntityRef, operation_id: u64 },

    /// The backend rejected the write or did not answer in time. Local state was rolled back.
    #[error("Command failed (operation {operation_id}): {reason}")]
    CommandFailed { operation_id: u64, reason: String },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(u64),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::ConflictingOperation { .. })
    }
}
