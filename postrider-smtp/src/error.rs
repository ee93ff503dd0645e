//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur while talking to a remote SMTP server.
///
/// The temporary/permanent split feeds the delivery engine's retry
/// decisions: 4xx replies, I/O failures and dropped connections are worth
/// retrying, 5xx replies and protocol violations are not.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse SMTP response: {0}")]
    Parse(String),

    #[error("SMTP error: {code} {message}")]
    Smtp { code: u16, message: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}

impl ClientError {
    /// Whether a retry on another host or a later attempt could succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Smtp { code, .. } => *code >= 400 && *code < 500,
            Self::Io(_) | Self::ConnectionClosed => true,
            Self::Parse(_) | Self::Tls(_) => false,
        }
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Smtp { code, .. } => *code >= 500 && *code < 600,
            Self::Parse(_) => true,
            Self::Io(_) | Self::ConnectionClosed | Self::Tls(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_hundreds_are_temporary() {
        let err = ClientError::Smtp {
            code: 421,
            message: "service not available".to_string(),
        };
        assert!(err.is_temporary());
        assert!(!err.is_permanent());
    }

    #[test]
    fn five_hundreds_are_permanent() {
        let err = ClientError::Smtp {
            code: 550,
            message: "user unknown".to_string(),
        };
        assert!(!err.is_temporary());
        assert!(err.is_permanent());
    }

    #[test]
    fn io_errors_are_temporary() {
        let err = ClientError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(err.is_temporary());
        assert!(!err.is_permanent());
    }
}
