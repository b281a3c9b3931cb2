use config::{Config, ConfigError, Environment};
use device_sync::{SyncEngineConfig, DEVICES_TABLE, ROOMS_TABLE, TEMPERATURE_TABLE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,

    // Sync engine configuration
    /// Bounded wait for a backend write in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Bounded wait for the bulk read in milliseconds
    #[serde(default = "default_bulk_read_timeout_ms")]
    pub bulk_read_timeout_ms: u64,

    /// Age after which an in-flight operation is garbage collected, in seconds
    #[serde(default = "default_pending_operation_ttl_secs")]
    pub pending_operation_ttl_secs: u64,

    /// Finished operations kept for diagnostics
    #[serde(default = "default_operation_history_capacity")]
    pub operation_history_capacity: usize,

    /// Maintenance loop interval in seconds
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    // Change feed configuration
    /// Change-feed channels (comma-separated table names)
    #[serde(default = "default_change_feed_channels")]
    pub change_feed_channels: String,

    /// Delay before resubscribing after the feed drops, in milliseconds
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,

    // Simulation configuration
    /// Drive the in-process backend with simulated sensor readings and remote toggles
    #[serde(default = "default_simulation_enabled")]
    pub simulation_enabled: bool,

    /// Simulation tick interval in seconds
    #[serde(default = "default_simulation_interval_secs")]
    pub simulation_interval_secs: u64,

    /// Every n-th simulation tick flips one device
    #[serde(default = "default_simulation_toggle_every")]
    pub simulation_toggle_every: u64,

    /// Closer timeout on shutdown in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

fn default_service_name() -> String {
    "homedash-all-in-one".to_string()
}

// Sync engine defaults
fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_bulk_read_timeout_ms() -> u64 {
    30_000
}

fn default_pending_operation_ttl_secs() -> u64 {
    60
}

fn default_operation_history_capacity() -> usize {
    50
}

fn default_maintenance_interval_secs() -> u64 {
    15
}

// Change feed defaults
fn default_change_feed_channels() -> String {
    format!("{ROOMS_TABLE},{DEVICES_TABLE},{TEMPERATURE_TABLE}")
}

fn default_resubscribe_delay_ms() -> u64 {
    1_000
}

// Simulation defaults
fn default_simulation_enabled() -> bool {
    true
}

fn default_simulation_interval_secs() -> u64 {
    5
}

fn default_simulation_toggle_every() -> u64 {
    3
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("HOMEDASH").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn sync_engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            command_timeout_ms: self.command_timeout_ms,
            bulk_read_timeout_ms: self.bulk_read_timeout_ms,
            pending_operation_ttl_secs: self.pending_operation_ttl_secs,
            operation_history_capacity: self.operation_history_capacity,
            resubscribe_delay_ms: self.resubscribe_delay_ms,
            maintenance_interval_secs: self.maintenance_interval_secs,
        }
    }

    /// Parsed channel list; empty entries are skipped
    pub fn channels(&self) -> Vec<String> {
        self.change_feed_channels
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn simulation_interval(&self) -> Duration {
        Duration::from_secs(self.simulation_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("HOMEDASH_LOG_LEVEL");
            std::env::remove_var("HOMEDASH_COMMAND_TIMEOUT_MS");
            std::env::remove_var("HOMEDASH_CHANGE_FEED_CHANNELS");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.channels(), vec!["rooms", "devices", "temperature_data"]);
        assert_eq!(
            config.sync_engine_config().command_timeout(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("HOMEDASH_LOG_LEVEL", "debug");
            std::env::set_var("HOMEDASH_COMMAND_TIMEOUT_MS", "2500");
            std::env::set_var("HOMEDASH_CHANGE_FEED_CHANNELS", "devices, ,rooms");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.command_timeout_ms, 2500);
        assert_eq!(config.channels(), vec!["devices", "rooms"]);

        // Clean up
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("HOMEDASH_LOG_LEVEL");
            std::env::remove_var("HOMEDASH_COMMAND_TIMEOUT_MS");
            std::env::remove_var("HOMEDASH_CHANGE_FEED_CHANNELS");
        }
    }
}
