use crate::domain::SyncEngine;
use crate::realtime::ChangeFeedService;
use anyhow::{Context, Result};
use common::realtime::{
    ChangeFeedLoggingLayer, ChangeFeedLoggingService, ChangeFeedMessage, ChangeFeedSource,
    ChangeFeedSubscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder};
use tracing::{debug, error, info, warn};

type ChangeFeedLayeredService = ChangeFeedLoggingService<ChangeFeedService>;

/// Consumes the change feed and drives every message through the sync engine.
///
/// The subscription is opened on construction, so creating the consumer
/// before the initial bulk read leaves no window where events are missed.
/// When the subscription is lost the consumer resubscribes and then runs a
/// full resync.
pub struct ChangeFeedConsumer {
    source: Arc<dyn ChangeFeedSource>,
    channels: Vec<String>,
    engine: Arc<SyncEngine>,
    service: ChangeFeedLayeredService,
    subscription: ChangeFeedSubscription,
    resubscribe_delay: Duration,
}

impl ChangeFeedConsumer {
    pub async fn new(
        source: Arc<dyn ChangeFeedSource>,
        channels: Vec<String>,
        engine: Arc<SyncEngine>,
    ) -> Result<Self> {
        debug!(channels = ?channels, "initializing change feed consumer with Tower middleware");

        let subscription = source
            .subscribe(&channels)
            .await
            .context("failed to subscribe to change feed")?;

        let resubscribe_delay = engine.config().resubscribe_delay();
        let service = ServiceBuilder::new()
            .layer(ChangeFeedLoggingLayer::new())
            .service(ChangeFeedService::new(Arc::clone(&engine)));

        Ok(Self {
            source,
            channels,
            engine,
            service,
            subscription,
            resubscribe_delay,
        })
    }

    /// Run the consumer loop until cancellation
    pub async fn run(mut self, ctx: CancellationToken) -> Result<()> {
        info!(channels = ?self.channels, "change feed consumer started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("received shutdown signal, stopping change feed consumer");
                    break;
                }
                msg = self.subscription.recv() => match msg {
                    Some(msg) => self.process(msg).await,
                    None => {
                        warn!("change feed subscription lost");
                        match self.recover(&ctx).await {
                            Some(resubscribed) => self.subscription = resubscribed,
                            None => break,
                        }
                    }
                }
            }
        }

        self.subscription.close();
        debug!("change feed consumer stopped gracefully");
        Ok(())
    }

    async fn process(&mut self, msg: ChangeFeedMessage) {
        let channel = msg.channel.clone();
        // outcomes are logged by the logging layer
        if let Err(e) = self.service.call(msg).await {
            error!(channel = %channel, error = %e, "service error processing message");
        }
    }

    /// Resubscribes, then resyncs. Returns `None` when cancelled first.
    async fn recover(&self, ctx: &CancellationToken) -> Option<ChangeFeedSubscription> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return None,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }

            let subscription = match self.source.subscribe(&self.channels).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "resubscribe failed, retrying");
                    continue;
                }
            };

            match self.engine.resync().await {
                Ok(()) => {
                    info!("change feed resubscribed and state resynced");
                    return Some(subscription);
                }
                Err(e) => warn!(error = %e, "resync after resubscribe failed, retrying"),
            }
        }
    }
}
