use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One raw message delivered by the change-feed subscription.
///
/// Owns its payload so it can travel through Tower middleware without
/// borrowing from the subscription.
#[derive(Debug, Clone)]
pub struct ChangeFeedMessage {
    /// Subscription channel the message arrived on (e.g. `devices`)
    pub channel: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl ChangeFeedMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// What happened to a consumed message. The feed has no redelivery, so a
/// dropped message is gone; the reason is only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFeedResponse {
    Applied,
    Dropped(Option<String>),
}

impl ChangeFeedResponse {
    pub fn applied() -> Self {
        Self::Applied
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        Self::Dropped(Some(reason.into()))
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Dropped(_) => "dropped",
        }
    }
}
