mod backend;
mod change_event;
mod device;
mod entity;
mod result;
mod room;
mod temperature;

pub use backend::*;
pub use change_event::*;
pub use device::*;
pub use entity::*;
pub use result::*;
pub use room::*;
pub use temperature::*;
