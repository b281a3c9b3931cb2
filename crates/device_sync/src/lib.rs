mod device_sync;
mod domain;
mod realtime;
mod simulation;

pub use device_sync::*;
pub use domain::*;
pub use realtime::*;
pub use simulation::*;
