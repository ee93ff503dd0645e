//! Dial strategy selection and racing.
//!
//! Port 25 prefers STARTTLS but may fall back to implicit TLS or plaintext;
//! the submission ports 465 and 587 prefer implicit TLS with a STARTTLS
//! fallback; any other port is dialed in plaintext (useful for tests). All
//! strategies for a host race concurrently and the first working client
//! wins; surplus clients are closed by the race.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use postrider_smtp::{ClientConnection, SmtpClient};
use tokio::{
    net::{TcpSocket, TcpStream},
    time::timeout,
};
use tokio_rustls::rustls::ClientConfig;
use tracing::debug;

use crate::{
    error::DialError,
    race::{race, Close, RaceError},
};

/// Default timeout for establishing one connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    StartTls,
    ImplicitTls,
    Plain,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartTls => write!(f, "starttls"),
            Self::ImplicitTls => write!(f, "tls"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

const fn strategies_for(port: u16) -> &'static [Strategy] {
    match port {
        25 => &[Strategy::StartTls, Strategy::ImplicitTls, Strategy::Plain],
        465 | 587 => &[Strategy::ImplicitTls, Strategy::StartTls],
        _ => &[Strategy::Plain],
    }
}

/// Establishes SMTP client connections to MX hosts.
pub struct Dialer {
    ehlo_domain: String,
    local_addr: Option<IpAddr>,
    dial_timeout: Duration,
    tls: Arc<ClientConfig>,
}

impl Dialer {
    /// `ehlo_domain` is the identity used for the EHLO that precedes a
    /// STARTTLS upgrade. `local_addr` optionally pins the source address of
    /// every outbound socket.
    pub fn new(
        ehlo_domain: impl Into<String>,
        local_addr: Option<IpAddr>,
        tls: Arc<ClientConfig>,
    ) -> Self {
        Self {
            ehlo_domain: ehlo_domain.into(),
            local_addr,
            dial_timeout: DIAL_TIMEOUT,
            tls,
        }
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Races every applicable (port, strategy) combination against one host
    /// and returns the first client that completes its handshake.
    ///
    /// # Errors
    ///
    /// Returns the aggregated dial errors if no strategy succeeds.
    pub async fn dial(
        &self,
        host: &str,
        ports: &[u16],
    ) -> Result<SmtpClient, RaceError<DialError>> {
        let mut attempts: Vec<Pin<Box<dyn std::future::Future<Output = Result<SmtpClient, DialError>> + Send>>> =
            Vec::new();
        for &port in ports {
            for &strategy in strategies_for(port) {
                debug!(host, port, %strategy, "dialing mx host");
                attempts.push(Box::pin(attempt(
                    host.to_string(),
                    port,
                    strategy,
                    self.ehlo_domain.clone(),
                    self.local_addr,
                    self.dial_timeout,
                    Arc::clone(&self.tls),
                )));
            }
        }
        race(attempts).await
    }
}

/// One dial attempt: connect, negotiate the strategy's TLS variant and
/// consume the greeting, leaving the client ready for EHLO.
async fn attempt(
    host: String,
    port: u16,
    strategy: Strategy,
    ehlo_domain: String,
    local_addr: Option<IpAddr>,
    dial_timeout: Duration,
    tls: Arc<ClientConfig>,
) -> Result<SmtpClient, DialError> {
    let address = format!("{host}:{port}");
    let stream = connect_tcp(&address, local_addr, dial_timeout).await?;

    let handshake = |source| DialError::Handshake {
        address: address.clone(),
        source,
    };

    match strategy {
        Strategy::Plain => {
            let mut client = SmtpClient::new(ClientConnection::Plain(stream), host);
            client.read_greeting().await.map_err(handshake)?;
            Ok(client)
        }
        Strategy::ImplicitTls => {
            let connection = ClientConnection::connect_tls(stream, tls, &host)
                .await
                .map_err(handshake)?;
            let mut client = SmtpClient::new(connection, host);
            client.read_greeting().await.map_err(handshake)?;
            Ok(client)
        }
        Strategy::StartTls => {
            let mut client = SmtpClient::new(ClientConnection::Plain(stream), host);
            client.read_greeting().await.map_err(handshake)?;
            let ehlo = client.ehlo(&ehlo_domain).await.map_err(handshake)?;
            if !ehlo.is_success() {
                return Err(handshake(ehlo.into_error()));
            }
            client.starttls(tls).await.map_err(handshake)?;
            Ok(client)
        }
    }
}

async fn connect_tcp(
    address: &str,
    local_addr: Option<IpAddr>,
    dial_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let connect = async {
        match local_addr {
            None => TcpStream::connect(address).await,
            Some(ip) => connect_from(address, ip).await,
        }
    };
    timeout(dial_timeout, connect)
        .await
        .map_err(|_| DialError::Timeout {
            address: address.to_string(),
        })?
        .map_err(|source| DialError::Connect {
            address: address.to_string(),
            source,
        })
}

/// Connects with the outbound socket bound to a configured source address.
async fn connect_from(address: &str, ip: IpAddr) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for remote in tokio::net::lookup_host(address).await? {
        if remote.is_ipv4() != ip.is_ipv4() {
            continue;
        }
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(ip, 0))?;
        match socket.connect(remote).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no address family matches the configured source address",
        )
    }))
}

#[async_trait::async_trait]
impl Close for SmtpClient {
    async fn close(self) {
        SmtpClient::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_25_prefers_starttls_with_fallbacks() {
        assert_eq!(
            strategies_for(25),
            &[Strategy::StartTls, Strategy::ImplicitTls, Strategy::Plain]
        );
    }

    #[test]
    fn submission_ports_prefer_implicit_tls() {
        for port in [465, 587] {
            assert_eq!(
                strategies_for(port),
                &[Strategy::ImplicitTls, Strategy::StartTls]
            );
        }
    }

    #[test]
    fn other_ports_dial_plaintext() {
        assert_eq!(strategies_for(2525), &[Strategy::Plain]);
        assert_eq!(strategies_for(11525), &[Strategy::Plain]);
    }
}
