mod change_feed_consumer;
mod change_feed_service;

pub use change_feed_consumer::*;
pub use change_feed_service::*;
