//! Shared building blocks for the postrider relay.
//!
//! Everything in here is consumed by at least two of the pipeline crates:
//! configuration, logging setup, the envelope message types that travel
//! through the queues, the inbound connection policy and the user store.

pub mod config;
pub mod logging;
pub mod message;
pub mod policy;
pub mod users;

pub use tracing;

/// Broadcast to every long-lived consumer when the relay is going down.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
