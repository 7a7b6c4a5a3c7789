//! Durable inbox for inbound chat requests.

pub mod model;
pub mod queue;

pub use model::{MessageStatus, QueueStats, QueuedMessage, Threading};
pub use queue::PersistentQueue;
