mod activity;
mod in_memory_backend;

pub use activity::*;
pub use in_memory_backend::*;
