//! Preprocessing pipeline between the receive queue and the send queue.
//!
//! For every received message the [`Processor`] applies the receive
//! processors in order (canonically the DKIM signer), fans the result out
//! into one queued message per recipient, and applies the pre-send
//! processors to each of them (canonically the send enqueuer). Signing
//! happens once per message, before fan-out, so every recipient receives
//! the identical signed body.

pub mod dkim;

use std::sync::Arc;

use async_trait::async_trait;
use postrider_common::{
    logging,
    message::{QueuedMessage, ReceivedMessage},
    Signal,
};
use postrider_queue::{JobHandler, QueueError, QueueOptions, WorkQueue};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, Instrument};

pub use dkim::DkimSignProcessor;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to sign message: {0}")]
    Sign(String),

    #[error("invalid DKIM key: {0}")]
    Key(String),

    #[error("failed to enqueue message for delivery: {0}")]
    Enqueue(#[from] QueueError),
}

/// Maps a received message to a received message, e.g. by adding a header.
/// The first failing processor aborts the chain.
#[async_trait]
pub trait ReceiveProcessor: Send + Sync {
    async fn process(&self, message: ReceivedMessage) -> Result<ReceivedMessage, ProcessError>;
}

/// Maps a queued message to a queued message after fan-out.
#[async_trait]
pub trait PreSendProcessor: Send + Sync {
    async fn process(&self, message: QueuedMessage) -> Result<QueuedMessage, ProcessError>;
}

/// Enqueues each queued message into the send queue with a fixed attempt
/// budget. The canonical last pre-send processor.
pub struct SendEnqueuer {
    send_queue: Arc<dyn WorkQueue<QueuedMessage>>,
    attempts: u32,
}

impl SendEnqueuer {
    pub fn new(send_queue: Arc<dyn WorkQueue<QueuedMessage>>, attempts: u32) -> Self {
        Self {
            send_queue,
            attempts,
        }
    }
}

#[async_trait]
impl PreSendProcessor for SendEnqueuer {
    async fn process(&self, message: QueuedMessage) -> Result<QueuedMessage, ProcessError> {
        self.send_queue
            .queue(
                message.clone(),
                QueueOptions::default().with_attempts(self.attempts),
            )
            .await?;
        Ok(message)
    }
}

/// Consumer of the receive queue.
pub struct Processor {
    receive_queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    receive_processors: Vec<Arc<dyn ReceiveProcessor>>,
    pre_send_processors: Vec<Arc<dyn PreSendProcessor>>,
}

impl Processor {
    pub fn new(receive_queue: Arc<dyn WorkQueue<ReceivedMessage>>) -> Self {
        Self {
            receive_queue,
            receive_processors: Vec::new(),
            pre_send_processors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_receive_processor(mut self, processor: Arc<dyn ReceiveProcessor>) -> Self {
        self.receive_processors.push(processor);
        self
    }

    #[must_use]
    pub fn with_pre_send_processor(mut self, processor: Arc<dyn PreSendProcessor>) -> Self {
        self.pre_send_processors.push(processor);
        self
    }

    /// Consumes the receive queue until shutdown.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable queue errors.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), QueueError> {
        info!("preprocessing pipeline starting");
        let queue = Arc::clone(&self.receive_queue);
        queue.consume(shutdown, self).await
    }

    async fn process_received(&self, mut message: ReceivedMessage) -> Result<(), ProcessError> {
        if message.mail_options.is_none() {
            message.mail_options = Some(Default::default());
        }
        info!("processing received message");

        for processor in &self.receive_processors {
            message = processor.process(message).await?;
        }

        let queued = message.queued_messages();
        let mut first_error = None;
        for mut queued_message in queued {
            let to = queued_message.to.clone();
            for processor in &self.pre_send_processors {
                match processor.process(queued_message).await {
                    Ok(message) => queued_message = message,
                    Err(err) => {
                        // A failing recipient must not block its siblings;
                        // the receive job is only acked once all of them
                        // have been attempted.
                        error!(to = %to, %err, "failed to process queued message");
                        first_error = Some(err);
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobHandler<ReceivedMessage> for Processor {
    async fn handle(&self, message: ReceivedMessage) -> anyhow::Result<()> {
        let span = logging::receive_span(&message);
        self.process_received(message)
            .instrument(span)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postrider_common::message::{MailOptions, Recipient};
    use postrider_queue::MemoryWorkQueue;

    struct UppercaseBody;

    #[async_trait]
    impl ReceiveProcessor for UppercaseBody {
        async fn process(&self, mut message: ReceivedMessage) -> Result<ReceivedMessage, ProcessError> {
            message.body = message.body.to_ascii_uppercase();
            Ok(message)
        }
    }

    struct FailingReceive;

    #[async_trait]
    impl ReceiveProcessor for FailingReceive {
        async fn process(&self, _message: ReceivedMessage) -> Result<ReceivedMessage, ProcessError> {
            Err(ProcessError::Sign("induced".to_string()))
        }
    }

    struct FailFor {
        to: String,
    }

    #[async_trait]
    impl PreSendProcessor for FailFor {
        async fn process(&self, message: QueuedMessage) -> Result<QueuedMessage, ProcessError> {
            if message.to == self.to {
                return Err(ProcessError::Sign("induced".to_string()));
            }
            Ok(message)
        }
    }

    fn received(recipients: &[&str]) -> ReceivedMessage {
        ReceivedMessage {
            from: "from@example.com".to_string(),
            recipients: recipients.iter().map(|addr| Recipient::new(*addr)).collect(),
            body: b"hello\r\n".to_vec(),
            mail_options: Some(MailOptions {
                envelope_id: Some("foo-id".to_string()),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn fans_out_into_send_queue() {
        let send_queue = Arc::new(MemoryWorkQueue::new());
        let processor = Processor::new(Arc::new(MemoryWorkQueue::new()))
            .with_pre_send_processor(Arc::new(SendEnqueuer::new(send_queue.clone(), 3)));

        processor
            .process_received(received(&["a@x.test", "b@y.test"]))
            .await
            .unwrap();

        let queued = send_queue.queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].to, "a@x.test");
        assert_eq!(queued[1].to, "b@y.test");
        assert_eq!(queued[0].from, "from@example.com");
        assert_eq!(queued[0].envelope_id(), "foo-id");
        assert_eq!(queued[0].body, queued[1].body);
    }

    #[tokio::test]
    async fn receive_processors_run_before_fan_out() {
        let send_queue = Arc::new(MemoryWorkQueue::new());
        let processor = Processor::new(Arc::new(MemoryWorkQueue::new()))
            .with_receive_processor(Arc::new(UppercaseBody))
            .with_pre_send_processor(Arc::new(SendEnqueuer::new(send_queue.clone(), 3)));

        processor
            .process_received(received(&["a@x.test", "b@y.test"]))
            .await
            .unwrap();

        for message in send_queue.queued() {
            assert_eq!(message.body, b"HELLO\r\n");
        }
    }

    #[tokio::test]
    async fn failing_receive_processor_aborts_before_fan_out() {
        let send_queue = Arc::new(MemoryWorkQueue::new());
        let processor = Processor::new(Arc::new(MemoryWorkQueue::new()))
            .with_receive_processor(Arc::new(FailingReceive))
            .with_pre_send_processor(Arc::new(SendEnqueuer::new(send_queue.clone(), 3)));

        let result = processor.process_received(received(&["a@x.test"])).await;
        assert!(result.is_err());
        assert!(send_queue.is_empty());
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_siblings() {
        let send_queue = Arc::new(MemoryWorkQueue::new());
        let processor = Processor::new(Arc::new(MemoryWorkQueue::new()))
            .with_pre_send_processor(Arc::new(FailFor {
                to: "a@x.test".to_string(),
            }))
            .with_pre_send_processor(Arc::new(SendEnqueuer::new(send_queue.clone(), 3)));

        let result = processor
            .process_received(received(&["a@x.test", "b@y.test"]))
            .await;

        // The sibling was still enqueued, but the job as a whole reports
        // the failure so the queue retries it.
        assert!(result.is_err());
        let queued = send_queue.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].to, "b@y.test");
    }

    #[tokio::test]
    async fn missing_mail_options_are_defaulted() {
        let send_queue = Arc::new(MemoryWorkQueue::new());
        let processor = Processor::new(Arc::new(MemoryWorkQueue::new()))
            .with_pre_send_processor(Arc::new(SendEnqueuer::new(send_queue.clone(), 3)));

        let mut message = received(&["a@x.test"]);
        message.mail_options = None;
        processor.process_received(message).await.unwrap();

        assert_eq!(send_queue.queued()[0].mail_options, Some(MailOptions::default()));
    }
}
