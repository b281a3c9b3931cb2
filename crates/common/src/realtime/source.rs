use crate::realtime::ChangeFeedMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A live subscription to one or more change-feed channels. The feed has
/// at-least-once, possibly duplicated, possibly reordered delivery. When
/// `recv` returns `None` the channel was lost and local state may be stale.
pub struct ChangeFeedSubscription {
    receiver: mpsc::Receiver<ChangeFeedMessage>,
}

impl ChangeFeedSubscription {
    pub fn new(receiver: mpsc::Receiver<ChangeFeedMessage>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<ChangeFeedMessage> {
        self.receiver.recv().await
    }

    /// Closes the subscription; buffered messages can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Opens change-feed subscriptions
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn subscribe(&self, channels: &[String]) -> anyhow::Result<ChangeFeedSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = ChangeFeedSubscription::new(rx);

        tx.send(ChangeFeedMessage::new("devices", "{}"))
            .await
            .unwrap();
        drop(tx);

        assert!(subscription.recv().await.is_some());
        assert!(subscription.recv().await.is_none());
    }
}
