use crate::simulation::InMemoryDashboardBackend;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the activity simulation
#[derive(Debug, Clone)]
pub struct ActivitySimulationConfig {
    /// Interval between simulation ticks
    pub interval: Duration,
    /// Every n-th tick another client flips one device
    pub toggle_every: u64,
}

impl Default for ActivitySimulationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            toggle_every: 3,
        }
    }
}

/// Drives the in-memory backend like a live house: every tick records a
/// temperature/humidity sample per room, and periodically another client
/// flips a device (round robin). Everything arrives through the change feed.
pub async fn run_activity_simulation(
    ctx: CancellationToken,
    config: ActivitySimulationConfig,
    backend: Arc<InMemoryDashboardBackend>,
) -> Result<()> {
    info!(interval = ?config.interval, "activity simulation started");
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                info!("received shutdown signal, stopping activity simulation");
                break;
            }
            _ = tokio::time::sleep(config.interval) => {
                tick += 1;
                let now = Utc::now();

                for (i, room_id) in backend.room_ids().await.iter().enumerate() {
                    let phase = tick as f64 / 6.0 + i as f64;
                    let temperature = 21.0 + 2.5 * phase.sin();
                    let humidity = 45.0 + 8.0 * phase.cos();
                    if let Err(e) = backend
                        .record_temperature(room_id, temperature, humidity, now)
                        .await
                    {
                        warn!(room_id = %room_id, error = %e, "failed to record sample");
                    }
                }

                if config.toggle_every > 0 && tick % config.toggle_every == 0 {
                    let device_ids = backend.device_ids().await;
                    if device_ids.is_empty() {
                        continue;
                    }
                    let index = ((tick / config.toggle_every) as usize) % device_ids.len();
                    let device_id = &device_ids[index];
                    if let Some(device) = backend.device(device_id).await {
                        match backend.set_device_power_remotely(device_id, !device.is_on).await {
                            Ok(()) => debug!(device_id = %device_id, is_on = !device.is_on, "simulated remote toggle"),
                            Err(e) => warn!(device_id = %device_id, error = %e, "simulated toggle failed"),
                        }
                    }
                }
            }
        }
    }

    info!("activity simulation stopped gracefully");
    Ok(())
}
