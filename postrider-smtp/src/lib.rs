//! Outbound SMTP client.
//!
//! The delivery engine establishes the TCP (or TLS) connection itself so it
//! can control timeouts and source binding; this crate wraps an established
//! connection into a command-level client with multi-line response parsing
//! and optional STARTTLS upgrade.

pub mod client;
pub mod connection;
pub mod error;
pub mod params;
pub mod response;

pub use client::SmtpClient;
pub use connection::{tls_client_config, ClientConnection};
pub use error::ClientError;
pub use response::Response;
