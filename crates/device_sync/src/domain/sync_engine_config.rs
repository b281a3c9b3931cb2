use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Bounded wait for a backend write before it is treated as failed (default: 10 seconds)
    pub command_timeout_ms: u64,

    /// Bounded wait for the bulk read (default: 30 seconds)
    pub bulk_read_timeout_ms: u64,

    /// Orphaned operations older than this are garbage collected (default: 60 seconds)
    pub pending_operation_ttl_secs: u64,

    /// Finished operations kept for diagnostics (default: 50)
    pub operation_history_capacity: usize,

    /// Delay before resubscribing after the change feed drops (default: 1 second)
    pub resubscribe_delay_ms: u64,

    /// Interval of the maintenance loop (default: 15 seconds)
    pub maintenance_interval_secs: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            bulk_read_timeout_ms: 30_000,
            pending_operation_ttl_secs: 60,
            operation_history_capacity: 50,
            resubscribe_delay_ms: 1_000,
            maintenance_interval_secs: 15,
        }
    }
}

impl SyncEngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn bulk_read_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_read_timeout_ms)
    }

    pub fn pending_operation_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_operation_ttl_secs)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncEngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.pending_operation_ttl(), Duration::from_secs(60));
        assert_eq!(config.operation_history_capacity, 50);
    }
}
