//! Send-queue consumer driving the SMTP dialog with bounded retry.

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use postrider_common::{logging, message::QueuedMessage, Signal};
use postrider_queue::{JobHandler, QueueError, QueueOptions, WorkQueue};
use postrider_smtp::{tls_client_config, Response, SmtpClient};
use tokio::{sync::broadcast, time::timeout};
use tracing::{error, info, warn, Instrument};

use crate::{
    dial::Dialer,
    error::DeliveryError,
    mx::MxResolver,
};

/// Attempts a message gets before it is dropped for good.
pub const MAX_RETRIES: u32 = 10;

/// Delay before a failed message becomes ready again.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(4 * 60);

/// End-to-end timeout for each SMTP command on the chosen client.
pub const SUBMISSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// EHLO identity for outbound dialogs.
    pub mail_domain: String,
    /// Remote ports tried per MX host.
    pub mx_ports: Vec<u16>,
    /// Optional source address for outbound sockets.
    pub send_addr: Option<IpAddr>,
    pub max_retries: u32,
    pub retry_period: Duration,
    pub command_timeout: Duration,
}

impl SenderConfig {
    pub fn new(mail_domain: impl Into<String>) -> Self {
        Self {
            mail_domain: mail_domain.into(),
            mx_ports: vec![25, 465, 587],
            send_addr: None,
            max_retries: MAX_RETRIES,
            retry_period: DEFAULT_RETRY_PERIOD,
            command_timeout: SUBMISSION_TIMEOUT,
        }
    }
}

/// The delivery engine. One instance consumes the whole send queue through
/// a bounded worker pool provided by the queue.
pub struct Sender {
    config: SenderConfig,
    queue: Arc<dyn WorkQueue<QueuedMessage>>,
    resolver: Arc<dyn MxResolver>,
    dialer: Dialer,
}

impl Sender {
    /// # Errors
    ///
    /// Returns an error if the outbound TLS configuration cannot be built.
    pub fn new(
        config: SenderConfig,
        queue: Arc<dyn WorkQueue<QueuedMessage>>,
        resolver: Arc<dyn MxResolver>,
    ) -> Result<Self, DeliveryError> {
        let tls = Arc::new(tls_client_config().map_err(DeliveryError::TlsConfig)?);
        let dialer = Dialer::new(config.mail_domain.clone(), config.send_addr, tls);
        Ok(Self {
            config,
            queue,
            resolver,
            dialer,
        })
    }

    /// Consumes the send queue until shutdown.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable queue errors.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), QueueError> {
        info!("delivery engine starting");
        let queue = Arc::clone(&self.queue);
        queue.consume(shutdown, self).await
    }

    /// One queue execution of a message. Delivery failures are accounted on
    /// the message and handled by explicit re-enqueue; the queue worker
    /// itself always sees success.
    async fn try_send(&self, mut message: QueuedMessage) -> Result<(), QueueError> {
        if message.mail_options.is_none() {
            message.mail_options = Some(Default::default());
        }
        info!("sending mail");

        let Err(err) = self.send_mail(&mut message).await else {
            return Ok(());
        };

        message.last_error = Some(err.to_string());
        message.error_count += 1;
        error!(%err, error_count = message.error_count, "failed to deliver mail");

        if message.error_count >= self.config.max_retries {
            error!(
                error_count = message.error_count,
                "giving up delivering mail"
            );
            return Ok(());
        }

        let attempts = self.config.max_retries - message.error_count;
        let options = QueueOptions::default()
            .with_attempts(attempts)
            .with_delay(self.config.retry_period);
        if let Err(err) = self.queue.queue(message, options).await {
            error!(%err, "failed to requeue failed message");
        }
        Ok(())
    }

    async fn send_mail(&self, message: &mut QueuedMessage) -> Result<(), DeliveryError> {
        message.last_attempt_at = Some(Utc::now());
        let domain = recipient_domain(&message.to)
            .ok_or_else(|| DeliveryError::InvalidRecipient(message.to.clone()))?;

        let hosts = self.resolver.lookup_mx(domain).await?;

        for mx in hosts {
            let mut client = match self.dialer.dial(&mx.host, &self.config.mx_ports).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(host = %mx.host, %err, "failed to dial host");
                    continue;
                }
            };

            match self.dialog(&mut client, message).await {
                Ok(()) => {
                    client.close().await;
                    info!(host = %mx.host, "successfully delivered message");
                    return Ok(());
                }
                Err(err) => {
                    warn!(host = %mx.host, %err, "smtp dialog failed");
                    client.close().await;
                }
            }
        }
        Err(DeliveryError::AllHostsFailed(message.to.clone()))
    }

    /// EHLO, MAIL FROM, RCPT TO, DATA with the full body, QUIT. Every
    /// command is bounded by the submission timeout.
    async fn dialog(
        &self,
        client: &mut SmtpClient,
        message: &QueuedMessage,
    ) -> Result<(), DeliveryError> {
        let response = self
            .run(client.ehlo(&self.config.mail_domain), "EHLO")
            .await?;
        check_success(response, "EHLO")?;

        let response = self
            .run(
                client.mail_from(&message.from, message.mail_options.as_ref()),
                "MAIL",
            )
            .await?;
        check_success(response, "MAIL")?;

        let response = self
            .run(client.rcpt_to(&message.to, &message.rcpt_options), "RCPT")
            .await?;
        check_success(response, "RCPT")?;

        let response = self.run(client.data(), "DATA").await?;
        if !response.is_intermediate() {
            return Err(DeliveryError::Dialog {
                command: "DATA",
                source: response.into_error(),
            });
        }

        let response = self.run(client.send_data(&message.body), "DATA").await?;
        check_success(response, "DATA")?;

        let response = self.run(client.quit(), "QUIT").await?;
        check_success(response, "QUIT")?;
        Ok(())
    }

    async fn run<F>(&self, command: F, name: &'static str) -> Result<Response, DeliveryError>
    where
        F: std::future::Future<Output = Result<Response, postrider_smtp::ClientError>>,
    {
        timeout(self.config.command_timeout, command)
            .await
            .map_err(|_| DeliveryError::DialogTimeout { command: name })?
            .map_err(|source| DeliveryError::Dialog {
                command: name,
                source,
            })
    }
}

fn check_success(response: Response, command: &'static str) -> Result<(), DeliveryError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(DeliveryError::Dialog {
            command,
            source: response.into_error(),
        })
    }
}

/// The delivery domain is everything right of the last `@`.
fn recipient_domain(to: &str) -> Option<&str> {
    match to.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Some(domain),
        _ => None,
    }
}

#[async_trait]
impl JobHandler<QueuedMessage> for Sender {
    async fn handle(&self, message: QueuedMessage) -> anyhow::Result<()> {
        let span = logging::delivery_span(&message);
        self.try_send(message)
            .instrument(span)
            .await
            .map_err(Into::into)
    }
}
