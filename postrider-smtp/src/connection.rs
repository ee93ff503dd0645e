//! Plain and TLS-wrapped client connections.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use tracing::warn;

use crate::error::{ClientError, Result};

/// An SMTP client connection, either plain TCP or TLS-wrapped.
pub enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    /// Wraps a freshly connected TCP stream with TLS (implicit TLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not a valid TLS server name or the
    /// handshake fails.
    pub async fn connect_tls(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        host: &str,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| ClientError::Tls(format!("invalid server name {host:?}: {err}")))?;
        let tls_stream = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|err| ClientError::Tls(err.to_string()))?;
        Ok(Self::Tls(Box::new(tls_stream)))
    }

    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    /// Upgrades a plain connection to TLS after a successful STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is already TLS or the handshake
    /// fails.
    pub(crate) async fn upgrade_to_tls(
        self,
        config: Arc<ClientConfig>,
        host: &str,
    ) -> Result<Self> {
        match self {
            Self::Plain(stream) => Self::connect_tls(stream, config, host).await,
            Self::Tls(_) => Err(ClientError::Tls("connection is already TLS".to_string())),
        }
    }

    /// Closes the connection, ignoring shutdown errors.
    pub(crate) async fn shutdown(self) {
        match self {
            Self::Plain(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Self::Tls(mut stream) => {
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Builds the TLS client configuration used for every outbound TLS variant:
/// native root certificates, minimum protocol version TLS 1.2.
///
/// # Errors
///
/// Returns an error if no native root certificate can be loaded.
pub fn tls_client_config() -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if let Err(err) = roots.add(cert) {
            warn!(%err, "skipping unusable native root certificate");
        }
    }
    if !native.errors.is_empty() {
        warn!(errors = ?native.errors, "some native root certificates could not be loaded");
    }
    if roots.is_empty() {
        // TLS dials will fail against every verifiable peer, but plaintext
        // strategies must keep working.
        warn!("no usable native root certificates found");
    }

    Ok(ClientConfig::builder_with_protocol_versions(&[
        &tokio_rustls::rustls::version::TLS13,
        &tokio_rustls::rustls::version::TLS12,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth())
}
