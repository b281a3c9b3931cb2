use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of backend-owned entity a change or command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Room,
    Device,
    TemperatureSample,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Room => "room",
            EntityKind::Device => "device",
            EntityKind::TemperatureSample => "temperature_sample",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a single entity. Device identifiers are unique across all rooms,
/// so the pair is the join key shared by the local store and change events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn room(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Room,
            id: id.into(),
        }
    }

    pub fn device(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Device,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}
