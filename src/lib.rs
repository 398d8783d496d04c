//! Feed relay — queueing, scheduled dispatch, and per-source message
//! transformation for forwarded feed content.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
