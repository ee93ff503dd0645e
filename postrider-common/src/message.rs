//! Envelope message types flowing through the relay.
//!
//! A [`ReceivedMessage`] is created once per accepted DATA command and owned
//! by the receive queue until preprocessing consumes it. Preprocessing fans
//! it out into one [`QueuedMessage`] per recipient, which the send queue owns
//! until delivery succeeds or the attempts are exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ESMTP parameters given with MAIL FROM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailOptions {
    /// ENVID parameter, propagated end-to-end for log correlation.
    #[serde(default)]
    pub envelope_id: Option<String>,
    /// Declared message size in bytes (SIZE parameter).
    #[serde(default)]
    pub size: Option<u64>,
    /// REQUIRETLS flag; delivery must not fall back to plaintext.
    #[serde(default)]
    pub require_tls: bool,
}

/// ESMTP parameters given with RCPT TO.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptOptions {
    /// DSN NOTIFY parameter, passed through verbatim.
    #[serde(default)]
    pub notify: Option<String>,
    /// DSN ORCPT parameter, passed through verbatim.
    #[serde(default)]
    pub original_recipient: Option<String>,
}

/// A single recipient of a received message, with its RCPT parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(default)]
    pub options: RcptOptions,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            options: RcptOptions::default(),
        }
    }
}

/// One message as accepted from an authenticated client, before signing
/// and fan-out. Carries all recipients of the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub from: String,
    pub recipients: Vec<Recipient>,
    pub body: Vec<u8>,
    #[serde(default)]
    pub mail_options: Option<MailOptions>,
}

impl ReceivedMessage {
    /// Fans the message out into one queued message per recipient.
    ///
    /// Bodies are copied verbatim, so every recipient receives exactly the
    /// bytes the receive processors produced. Attempt accounting starts at
    /// zero and `received_at` is stamped with the current time.
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        let received_at = Utc::now();
        self.recipients
            .iter()
            .map(|rcpt| QueuedMessage {
                from: self.from.clone(),
                to: rcpt.address.clone(),
                body: self.body.clone(),
                mail_options: self.mail_options.clone(),
                rcpt_options: rcpt.options.clone(),
                received_at,
                last_attempt_at: None,
                error_count: 0,
                last_error: None,
            })
            .collect()
    }

    pub fn envelope_id(&self) -> &str {
        envelope_id(self.mail_options.as_ref())
    }
}

/// A single-recipient delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub from: String,
    pub to: String,
    pub body: Vec<u8>,
    #[serde(default)]
    pub mail_options: Option<MailOptions>,
    #[serde(default)]
    pub rcpt_options: RcptOptions,

    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedMessage {
    pub fn envelope_id(&self) -> &str {
        envelope_id(self.mail_options.as_ref())
    }
}

fn envelope_id(opts: Option<&MailOptions>) -> &str {
    opts.and_then(|o| o.envelope_id.as_deref()).unwrap_or("na")
}
