//! Submission server: listener, peer admission and graceful shutdown.

use std::{sync::Arc, time::Duration};

use postrider_common::{
    message::ReceivedMessage, policy::ConnectionPolicy, users::UserStore, Signal,
};
use postrider_queue::WorkQueue;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};
use tracing::{debug, info, warn};

use crate::{session::Session, SessionConfig, SubmissionError};

/// Bound on waiting for open sessions during graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts submission connections and runs one [`Session`] per client.
pub struct SubmissionServer {
    listen_addr: String,
    config: Arc<SessionConfig>,
    policy: ConnectionPolicy,
    users: Arc<dyn UserStore>,
    queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    tls: Option<TlsAcceptor>,
}

impl SubmissionServer {
    pub fn new(
        listen_addr: impl Into<String>,
        config: SessionConfig,
        policy: ConnectionPolicy,
        users: Arc<dyn UserStore>,
        queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config: Arc::new(config),
            policy,
            users,
            queue,
            tls: None,
        }
    }

    /// Enables implicit TLS with the given server configuration. The
    /// configuration carries the SNI certificate resolver provided by the
    /// certificate collaborator.
    #[must_use]
    pub fn with_tls(mut self, server_config: Arc<ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(server_config));
        self
    }

    /// Serves until the shutdown signal fires, then waits up to
    /// [`SHUTDOWN_TIMEOUT`] for open sessions before aborting them.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SubmissionError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(
            listen_addr = %self.listen_addr,
            tls = self.tls.is_some(),
            "submission server listening"
        );

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "failed to accept connection");
                            continue;
                        }
                    };

                    if !self.policy.permits(peer.ip()) {
                        warn!(%peer, "refusing connection from disallowed address");
                        sessions.spawn(refuse(stream, peer));
                        continue;
                    }

                    let config = Arc::clone(&self.config);
                    let users = Arc::clone(&self.users);
                    let queue = Arc::clone(&self.queue);
                    let tls = self.tls.clone();
                    sessions.spawn(async move {
                        if let Err(err) = serve_connection(stream, peer, config, users, queue, tls).await {
                            debug!(%peer, %err, "session ended with error");
                        }
                    });
                }
            }
        }

        drop(listener);
        info!("submission server shutting down");
        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("sessions still open after shutdown deadline, closing forcibly");
            sessions.abort_all();
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    config: Arc<SessionConfig>,
    users: Arc<dyn UserStore>,
    queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            Session::new(stream, peer, config, users, queue).run().await
        }
        None => Session::new(stream, peer, config, users, queue).run().await,
    }
}

async fn refuse(mut stream: TcpStream, peer: std::net::SocketAddr) {
    let reply = format!("554 5.7.1 {} is not allowed to send mail\r\n", peer.ip());
    let _ = stream.write_all(reply.as_bytes()).await;
    let _ = stream.shutdown().await;
}
