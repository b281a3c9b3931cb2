use crate::domain::{EventDisposition, SyncEngine};
use common::realtime::{ChangeFeedMessage, ChangeFeedResponse};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::debug;

/// Tower service feeding one change-feed message into the sync engine.
///
/// Decode and apply errors never fail the service; they turn into a dropped
/// response so the consumer keeps going with the next message.
#[derive(Clone)]
pub struct ChangeFeedService {
    engine: Arc<SyncEngine>,
}

impl ChangeFeedService {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

impl Service<ChangeFeedMessage> for ChangeFeedService {
    type Response = ChangeFeedResponse;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, msg: ChangeFeedMessage) -> Self::Future {
        let engine = Arc::clone(&self.engine);

        Box::pin(async move {
            match engine.ingest(&msg.payload).await {
                Ok(EventDisposition::Ignored(reason)) => Ok(ChangeFeedResponse::dropped(reason)),
                Ok(disposition) => {
                    debug!(channel = %msg.channel, disposition = ?disposition, "change event handled");
                    Ok(ChangeFeedResponse::applied())
                }
                Err(e) => Ok(ChangeFeedResponse::dropped(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SyncEngineConfig;
    use common::domain::{DashboardSnapshot, MockDashboardBackend};
    use tower::ServiceExt;

    async fn service() -> ChangeFeedService {
        let mut backend = MockDashboardBackend::new();
        backend
            .expect_fetch_snapshot()
            .returning(|| Ok(DashboardSnapshot::default()));
        let engine = Arc::new(SyncEngine::new(Arc::new(backend), SyncEngineConfig::default()));
        engine.initialize().await.unwrap();
        ChangeFeedService::new(engine)
    }

    #[tokio::test]
    async fn test_valid_event_is_applied() {
        let payload = r#"{"table":"rooms","eventType":"INSERT","new":{"id":"office","name":"Office","image_url":null}}"#;
        let response = service()
            .await
            .oneshot(ChangeFeedMessage::new("rooms-changes", payload))
            .await
            .unwrap();

        assert_eq!(response, ChangeFeedResponse::Applied);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let response = service()
            .await
            .oneshot(ChangeFeedMessage::new("devices", "not json"))
            .await
            .unwrap();

        assert!(!response.is_applied());
    }
}
