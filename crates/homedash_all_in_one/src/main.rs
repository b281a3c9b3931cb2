mod config;

use common::domain::{DashboardSnapshot, Device, RoomRecord};
use common::telemetry::{init_telemetry, TelemetryConfig};
use config::ServiceConfig;
use device_sync::{
    run_activity_simulation, ActivitySimulationConfig, DeviceSync, DeviceSyncConfig,
    InMemoryDashboardBackend,
};
use homedash_runner::Runner;
use std::sync::Arc;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        service_name: config.service_name.clone(),
        log_level: config.log_level.clone(),
        json: config.log_json,
    }) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        service = %config.service_name,
        simulation_enabled = config.simulation_enabled,
        "Starting homedash-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let backend = Arc::new(InMemoryDashboardBackend::with_snapshot(seed_snapshot()));

    let device_sync = match DeviceSync::new(
        backend.clone(),
        backend.clone(),
        DeviceSyncConfig {
            channels: config.channels(),
            engine: config.sync_engine_config(),
        },
    )
    .await
    {
        Ok(module) => module,
        Err(e) => {
            error!("Failed to initialize device sync: {:#}", e);
            std::process::exit(1);
        }
    };
    let engine = device_sync.engine();

    let mut runner = Runner::new()
        .with_boxed_process(device_sync.maintenance_process())
        .with_boxed_process(device_sync.into_runner_process());

    if config.simulation_enabled {
        let simulation_config = ActivitySimulationConfig {
            interval: config.simulation_interval(),
            toggle_every: config.simulation_toggle_every,
        };
        let simulated_backend = Arc::clone(&backend);
        runner = runner.with_app_process(move |ctx| {
            run_activity_simulation(ctx, simulation_config, simulated_backend)
        });
    }

    let outcome = runner
        .with_closer(move || async move {
            let metrics = engine.metrics();
            info!(
                pending_operations = engine.pending_operation_count().await,
                total_devices_on = metrics.total_devices_on,
                "Cleanup complete"
            );
            Ok(())
        })
        .with_closer_timeout(config.shutdown_timeout())
        .run()
        .await;

    std::process::exit(outcome.exit_code());
}

/// Two rooms the dashboard starts with when the backend is in-process
fn seed_snapshot() -> DashboardSnapshot {
    let room = |room_id: &str, name: &str, devices: &[(&str, &str, bool)]| RoomRecord {
        room_id: room_id.to_string(),
        name: name.to_string(),
        image_url: format!("/images/rooms/{room_id}.jpg"),
        devices: devices
            .iter()
            .map(|(device_id, device_type, is_on)| Device {
                device_id: device_id.to_string(),
                room_id: room_id.to_string(),
                device_type: device_type.to_string(),
                image_url: format!("/images/devices/{device_id}.png"),
                is_on: *is_on,
            })
            .collect(),
    };

    DashboardSnapshot {
        rooms: vec![
            room(
                "office",
                "Office",
                &[
                    ("office-light-1", "Light 1", true),
                    ("office-light-2", "Light 2", false),
                    ("office-fan", "Fan", true),
                    ("office-ac", "AC", false),
                ],
            ),
            room(
                "living-room",
                "Living Room",
                &[
                    ("living-tv", "TV", false),
                    ("living-light", "Light", true),
                    ("living-camera", "Camera", true),
                    ("living-led-strip", "LED strip", false),
                ],
            ),
        ],
        temperatures: Vec::new(),
    }
}
