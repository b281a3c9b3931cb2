use crate::domain::{SyncEngine, SyncEngineConfig};
use crate::realtime::ChangeFeedConsumer;
use common::domain::DashboardBackend;
use common::realtime::ChangeFeedSource;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type RunnerProcess =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

pub struct DeviceSyncConfig {
    /// Change-feed channels to subscribe to (table names)
    pub channels: Vec<String>,
    pub engine: SyncEngineConfig,
}

/// Wires the sync engine to its collaborators: opens the change feed, runs the
/// initial bulk read and hands out the long-running processes.
pub struct DeviceSync {
    engine: Arc<SyncEngine>,
    consumer: ChangeFeedConsumer,
}

impl DeviceSync {
    pub async fn new(
        backend: Arc<dyn DashboardBackend>,
        change_feed: Arc<dyn ChangeFeedSource>,
        config: DeviceSyncConfig,
    ) -> anyhow::Result<Self> {
        debug!("initializing device sync module");

        let engine = Arc::new(SyncEngine::new(backend, config.engine));

        // subscribe before the bulk read; buffered events are applied afterwards
        let consumer =
            ChangeFeedConsumer::new(change_feed, config.channels, Arc::clone(&engine)).await?;
        engine.initialize().await?;

        Ok(Self { engine, consumer })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    /// Change-feed consumer process
    pub fn into_runner_process(self) -> RunnerProcess {
        Box::new({
            let consumer = self.consumer;
            move |ctx| Box::pin(async move { consumer.run(ctx).await })
        })
    }

    /// Periodic garbage collection of stale operations plus a metrics log line
    pub fn maintenance_process(&self) -> RunnerProcess {
        let engine = Arc::clone(&self.engine);
        let interval = engine.config().maintenance_interval();
        Box::new(move |ctx| Box::pin(run_maintenance(ctx, engine, interval)))
    }
}

pub async fn run_maintenance(
    ctx: CancellationToken,
    engine: Arc<SyncEngine>,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("stopping maintenance loop");
                break;
            }
            _ = ticker.tick() => {
                let collected = engine.collect_stale_operations().await;
                let pending_operations = engine.pending_operation_count().await;
                let metrics = engine.metrics();
                info!(
                    active_room = ?metrics.active_room_id,
                    devices_on = metrics.devices_on,
                    device_count = metrics.device_count,
                    total_devices_on = metrics.total_devices_on,
                    pending_operations,
                    collected,
                    "dashboard state"
                );
            }
        }
    }

    Ok(())
}
