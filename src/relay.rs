//! Wires the queues, pipeline, delivery engine and submission server into
//! one running relay.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use postrider_common::{
    config::Config,
    message::{QueuedMessage, ReceivedMessage},
    policy::ConnectionPolicy,
    users::FileUserStore,
    Signal,
};
use postrider_delivery::{DnsMxResolver, Sender, SenderConfig};
use postrider_pipeline::{DkimSignProcessor, Processor, SendEnqueuer};
use postrider_queue::SqliteWorkQueue;
use postrider_submission::{SessionConfig, SubmissionError, SubmissionServer, SHUTDOWN_TIMEOUT};
use tokio::{sync::broadcast, task::JoinSet, time::timeout};
use tracing::{error, info};

use crate::tls;

/// Workers per queue consumer.
const QUEUE_POOL_SIZE: usize = 10;

/// Lease visibility timeout for both queues.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts granted to each delivery job at enqueue time.
const SEND_ATTEMPTS: u32 = 3;

/// The assembled relay: all long-lived consumers plus the submission
/// server, governed by one shutdown channel.
pub struct Relay {
    shutdown: broadcast::Sender<Signal>,
    background: JoinSet<()>,
    server: tokio::task::JoinHandle<Result<(), SubmissionError>>,
}

impl Relay {
    /// Builds every component from the configuration and starts them.
    ///
    /// # Errors
    ///
    /// Returns an error for any initialization failure: queue store,
    /// DKIM keys, user file, CIDR ranges or TLS material.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.queue_path)
            .await
            .with_context(|| {
                format!(
                    "failed to ensure queue folder exists: {}",
                    config.queue_path.display()
                )
            })?;
        let db_path = config.queue_path.join("mail.queue");

        let receive_queue: SqliteWorkQueue<ReceivedMessage> =
            SqliteWorkQueue::open(&db_path, "receive.queue", QUEUE_POOL_SIZE, VISIBILITY_TIMEOUT)
                .await
                .context("failed to open receive queue")?;
        let send_queue: SqliteWorkQueue<QueuedMessage> = SqliteWorkQueue::on_pool(
            receive_queue.pool(),
            "send.queue",
            QUEUE_POOL_SIZE,
            VISIBILITY_TIMEOUT,
        )
        .await
        .context("failed to open send queue")?;

        let mut processor = Processor::new(Arc::new(receive_queue.clone()));
        for (name, signer) in &config.dkim.signer {
            let pem = signer
                .private_key
                .load()
                .with_context(|| format!("DKIM signer {name}"))?;
            let dkim = DkimSignProcessor::from_pem(&config.mail_domain, &signer.selector, &pem)
                .with_context(|| format!("DKIM signer {name}"))?;
            processor = processor.with_receive_processor(Arc::new(dkim));
            info!(signer = %name, selector = %signer.selector, "DKIM signer configured");
        }
        processor = processor.with_pre_send_processor(Arc::new(SendEnqueuer::new(
            Arc::new(send_queue.clone()),
            SEND_ATTEMPTS,
        )));
        let processor = Arc::new(processor);

        let mut sender_config = SenderConfig::new(config.mail_domain.clone());
        sender_config.mx_ports = config.mx_ports.clone();
        sender_config.send_addr = config.send_addr;
        let resolver = Arc::new(DnsMxResolver::system().context("failed to build DNS resolver")?);
        let sender = Arc::new(
            Sender::new(sender_config, Arc::new(send_queue.clone()), resolver)
                .context("failed to build delivery engine")?,
        );

        let users = Arc::new(
            FileUserStore::load(&config.user_file).context("failed to load user file")?,
        );
        let policy = ConnectionPolicy::from_ranges(&config.allowed_ip_ranges)?;

        let mut session_config = SessionConfig::new(config.mail_domain.clone());
        session_config.max_message_bytes = config.max_message_bytes;
        session_config.max_recipients = config.max_recipients;
        session_config.advertise_require_tls = config.listen_tls;

        let mut server = SubmissionServer::new(
            config.listen_addr.clone(),
            session_config,
            policy,
            users,
            Arc::new(receive_queue),
        );
        if config.listen_tls {
            let (cert_file, key_file) = match (&config.tls_cert_file, &config.tls_key_file) {
                (Some(cert), Some(key)) => (cert.clone(), key.clone()),
                _ => anyhow::bail!("listen_tls requires tls_cert_file and tls_key_file"),
            };
            let tls_config = tls::server_config(&cert_file, &key_file)?;
            server = server.with_tls(Arc::new(tls_config));
        }

        let (shutdown, _) = broadcast::channel(4);
        let mut background = JoinSet::new();

        background.spawn({
            let rx = shutdown.subscribe();
            async move {
                if let Err(err) = processor.serve(rx).await {
                    error!(%err, "preprocessing pipeline failed");
                }
            }
        });
        background.spawn({
            let rx = shutdown.subscribe();
            async move {
                if let Err(err) = sender.serve(rx).await {
                    error!(%err, "delivery engine failed");
                }
            }
        });

        let server = tokio::spawn({
            let rx = shutdown.subscribe();
            async move { server.serve(rx).await }
        });

        Ok(Self {
            shutdown,
            background,
            server,
        })
    }

    /// Runs until SIGINT/SIGTERM or a fatal server error, then shuts down
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission server fails while serving.
    pub async fn run_until_signal(mut self) -> anyhow::Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = &mut self.server => {
                // The server only returns on its own for fatal errors;
                // stop the consumers before reporting it.
                let _ = self.shutdown.send(Signal::Shutdown);
                while self.background.join_next().await.is_some() {}
                let result = result.context("submission server panicked")?;
                result.context("submission server failed")?;
                anyhow::bail!("submission server exited unexpectedly");
            }
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }

        info!("shutting down");
        self.shutdown().await;
        Ok(())
    }

    /// Signals every consumer and waits out the graceful window.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        let drain = async {
            let _ = (&mut self.server).await;
            while self.background.join_next().await.is_some() {}
        };
        // The server applies its own 30s session deadline; give it a
        // little slack on top before abandoning the tasks.
        if timeout(SHUTDOWN_TIMEOUT + Duration::from_secs(5), drain)
            .await
            .is_err()
        {
            error!("consumers did not stop within the shutdown deadline");
            self.background.abort_all();
            self.server.abort();
        }
    }
}
