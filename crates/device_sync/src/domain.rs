mod change_event_decoder;
mod metrics_aggregator;
mod pending_operation;
mod pending_operation_tracker;
mod state_store;
mod sync_engine;
mod sync_engine_config;

pub use change_event_decoder::*;
pub use metrics_aggregator::*;
pub use pending_operation::*;
pub use pending_operation_tracker::*;
pub use state_store::*;
pub use sync_engine::*;
pub use sync_engine_config::*;
