//! Inbound SMTP submission server.
//!
//! Accepts connections from allowlisted peers, authenticates them via SASL
//! PLAIN or LOGIN, walks the MAIL/RCPT/DATA state machine and enqueues one
//! [`postrider_common::message::ReceivedMessage`] per accepted transaction.

pub mod auth;
pub mod server;
pub mod session;

use thiserror::Error;

pub use server::{SubmissionServer, SHUTDOWN_TIMEOUT};
pub use session::SessionConfig;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
