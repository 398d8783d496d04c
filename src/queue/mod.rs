//! Queue model and manager.

pub mod manager;
pub mod model;

pub use manager::QueueManager;
pub use model::{MessageStatus, Queue, QueueKey, QueueReport, QueueState, QueuedMessage};
