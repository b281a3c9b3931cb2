mod consumer_logging;
mod source;
mod types;

pub use consumer_logging::*;
pub use source::*;
pub use types::*;
