//! Error taxonomy for the delivery engine.

use thiserror::Error;

use postrider_smtp::ClientError;

use crate::race::RaceError;

/// Errors from DNS resolution of a recipient domain.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no mail servers found for domain {0}")]
    NoMailServers(String),

    #[error("failed to lookup mx records for {domain}: {source}")]
    LookupFailed {
        domain: String,
        #[source]
        source: hickory_resolver::ResolveError,
    },

    #[error("failed to initialize resolver: {0}")]
    Init(#[from] hickory_resolver::ResolveError),
}

/// Errors from a single dial strategy.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {address} timed out")]
    Timeout { address: String },

    #[error("smtp handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: ClientError,
    },
}

/// Errors from one delivery attempt of a queued message. All of these are
/// transient from the engine's point of view; they count toward the
/// message's retry budget.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to build outbound TLS configuration: {0}")]
    TlsConfig(#[source] ClientError),

    #[error("invalid recipient address {0:?}: no domain part")]
    InvalidRecipient(String),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Dial(#[from] RaceError<DialError>),

    #[error("{command} command failed: {source}")]
    Dialog {
        command: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("{command} timed out")]
    DialogTimeout { command: &'static str },

    #[error("failed to deliver email to {0}")]
    AllHostsFailed(String),
}
