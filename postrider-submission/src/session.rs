//! Per-connection SMTP state machine.
//!
//! States: connected → authenticated → sender accepted → recipients
//! accepted → data. RSET discards the pending transaction but never the
//! authenticated subject; QUIT closes. Each accepted DATA enqueues exactly
//! one received message carrying all recipients of the transaction.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postrider_common::{
    message::{MailOptions, RcptOptions, ReceivedMessage, Recipient},
    users::UserStore,
};
use postrider_queue::{QueueOptions, WorkQueue};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::auth::{handle_auth, AuthOutcome};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity used in the banner and EHLO reply.
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    /// Bound on waiting for a client command or data line.
    pub read_timeout: Duration,
    /// Bound on writing one reply.
    pub write_timeout: Duration,
    /// Advertise the REQUIRETLS extension (only when listening with TLS).
    pub advertise_require_tls: bool,
}

impl SessionConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            max_message_bytes: 1024 * 1024,
            max_recipients: 2,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            advertise_require_tls: false,
        }
    }
}

/// The pending MAIL/RCPT transaction.
#[derive(Default)]
struct Transaction {
    from: Option<String>,
    mail_options: MailOptions,
    recipients: Vec<Recipient>,
}

pub(crate) struct Session<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    config: Arc<SessionConfig>,
    users: Arc<dyn UserStore>,
    queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    authenticated_subject: Option<String>,
    transaction: Transaction,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        users: Arc<dyn UserStore>,
        queue: Arc<dyn WorkQueue<ReceivedMessage>>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            peer,
            config,
            users,
            queue,
            authenticated_subject: None,
            transaction: Transaction::default(),
        }
    }

    pub(crate) async fn run(mut self) -> std::io::Result<()> {
        debug!(peer = %self.peer, "session started");
        self.reply(format!("220 {} ESMTP postrider", self.config.hostname))
            .await?;

        loop {
            let Some(line) = self.read_command_line().await? else {
                return Ok(());
            };
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            let upper = trimmed.to_ascii_uppercase();

            if upper.starts_with("EHLO") {
                self.reply_ehlo().await?;
            } else if upper.starts_with("HELO") {
                self.reply(format!("250 {}", self.config.hostname)).await?;
            } else if upper.starts_with("AUTH") {
                self.handle_auth(trimmed).await?;
            } else if upper.starts_with("MAIL FROM:") {
                self.handle_mail(trimmed).await?;
            } else if upper.starts_with("RCPT TO:") {
                self.handle_rcpt(trimmed).await?;
            } else if upper == "DATA" {
                self.handle_data().await?;
            } else if upper == "RSET" {
                // The transaction goes, the authenticated subject stays.
                self.transaction = Transaction::default();
                self.reply("250 2.0.0 OK").await?;
            } else if upper == "NOOP" {
                self.reply("250 2.0.0 OK").await?;
            } else if upper == "QUIT" {
                self.reply("221 2.0.0 bye").await?;
                return Ok(());
            } else {
                self.reply("500 5.5.2 command unrecognized").await?;
            }
        }
    }

    async fn reply_ehlo(&mut self) -> std::io::Result<()> {
        let mut capabilities = vec![
            self.config.hostname.clone(),
            format!("SIZE {}", self.config.max_message_bytes),
            "8BITMIME".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ];
        if self.config.advertise_require_tls {
            capabilities.push("REQUIRETLS".to_string());
        }
        let last = capabilities.len() - 1;
        for (i, capability) in capabilities.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let line = format!("250{separator}{capability}");
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.flush().await
    }

    async fn handle_auth(&mut self, line: &str) -> std::io::Result<()> {
        if self.authenticated_subject.is_some() {
            return self.reply("503 5.5.1 already authenticated").await;
        }
        match handle_auth(&mut self.reader, &mut self.writer, line, self.users.as_ref()).await? {
            AuthOutcome::Authenticated(username) => {
                info!(peer = %self.peer, username, "user authenticated");
                self.authenticated_subject = Some(username);
                self.reply("235 2.7.0 authentication successful").await
            }
            AuthOutcome::Failed => {
                warn!(peer = %self.peer, "authentication failed");
                self.reply("535 5.7.8 authentication credentials invalid")
                    .await
            }
            AuthOutcome::UnsupportedMechanism => {
                self.reply("504 5.5.4 unsupported authentication mechanism")
                    .await
            }
        }
    }

    async fn handle_mail(&mut self, line: &str) -> std::io::Result<()> {
        let Some(subject) = self.authenticated_subject.clone() else {
            return self.reply("530 5.7.0 not authenticated").await;
        };

        let Some((from, options)) = parse_mail_from(line) else {
            return self.reply("501 5.5.4 invalid MAIL FROM syntax").await;
        };

        if !self.users.is_valid_sender(&subject, &from) {
            warn!(peer = %self.peer, username = %subject, from = %from, "unauthorized sender");
            return self
                .reply(format!(
                    "550 5.7.1 user {subject} is not allowed to send emails as {from}"
                ))
                .await;
        }

        if let Some(size) = options.size {
            if size > self.config.max_message_bytes as u64 {
                return self
                    .reply("552 5.3.4 message size exceeds fixed maximum")
                    .await;
            }
        }

        self.transaction = Transaction {
            from: Some(from),
            mail_options: options,
            recipients: Vec::new(),
        };
        self.reply("250 2.1.0 sender OK").await
    }

    async fn handle_rcpt(&mut self, line: &str) -> std::io::Result<()> {
        if self.transaction.from.is_none() {
            return self.reply("503 5.5.1 need MAIL command").await;
        }
        if self.transaction.recipients.len() >= self.config.max_recipients {
            return self.reply("452 4.5.3 too many recipients").await;
        }
        let Some(recipient) = parse_rcpt_to(line) else {
            return self.reply("501 5.5.4 invalid RCPT TO syntax").await;
        };
        self.transaction.recipients.push(recipient);
        self.reply("250 2.1.5 recipient OK").await
    }

    async fn handle_data(&mut self) -> std::io::Result<()> {
        if self.transaction.from.is_none() {
            return self.reply("503 5.5.1 need MAIL command").await;
        }
        if self.transaction.recipients.is_empty() {
            return self.reply("503 5.5.1 need RCPT command").await;
        }

        self.reply("354 end data with <CRLF>.<CRLF>").await?;

        let body = match self.read_data().await? {
            Some(body) => body,
            None => return Ok(()),
        };

        if body.len() > self.config.max_message_bytes {
            self.transaction = Transaction::default();
            return self
                .reply("552 5.3.4 message size exceeds fixed maximum")
                .await;
        }

        let declared = self.transaction.mail_options.size.unwrap_or(0);
        if declared > 0 && body.len() as u64 != declared {
            let read = body.len();
            self.transaction = Transaction::default();
            return self
                .reply(format!(
                    "554 5.0.0 read only {read} body bytes, but expected {declared} bytes"
                ))
                .await;
        }

        let transaction = std::mem::take(&mut self.transaction);
        let message = ReceivedMessage {
            from: transaction.from.unwrap_or_default(),
            recipients: transaction.recipients,
            body,
            mail_options: Some(transaction.mail_options),
        };

        info!(
            peer = %self.peer,
            envelope_id = %message.envelope_id(),
            from = %message.from,
            recipients = message.recipients.len(),
            "message accepted"
        );

        if let Err(err) = self.queue.queue(message, QueueOptions::default()).await {
            warn!(peer = %self.peer, %err, "failed to queue message");
            return self.reply("451 4.3.0 failed to queue message").await;
        }
        self.reply("250 2.0.0 OK: queued").await
    }

    /// Reads dot-terminated message data, undoing dot-stuffing and
    /// normalizing line endings to CRLF.
    async fn read_data(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut body = Vec::new();
        loop {
            let mut line = String::new();
            let read = timeout(
                self.config.read_timeout,
                self.reader.read_line(&mut line),
            )
            .await;
            let Ok(read) = read else {
                warn!(peer = %self.peer, "timeout while reading message data");
                self.reply("421 4.4.2 idle timeout, closing connection")
                    .await?;
                return Ok(None);
            };
            if read? == 0 {
                return Ok(None);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                return Ok(Some(body));
            }
            let text = trimmed.strip_prefix('.').unwrap_or(trimmed);
            body.extend_from_slice(text.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
    }

    async fn read_command_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let read = timeout(self.config.read_timeout, self.reader.read_line(&mut line)).await;
        let Ok(read) = read else {
            debug!(peer = %self.peer, "session idle timeout");
            self.reply("421 4.4.2 idle timeout, closing connection")
                .await?;
            return Ok(None);
        };
        if read? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn reply(&mut self, text: impl AsRef<str>) -> std::io::Result<()> {
        let write_timeout = self.config.write_timeout;
        let write = async {
            self.writer.write_all(text.as_ref().as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
            self.writer.flush().await
        };
        timeout(write_timeout, write)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))?
    }
}

/// Parses `MAIL FROM:<addr> [SIZE=n] [REQUIRETLS] [ENVID=x] ...`.
fn parse_mail_from(line: &str) -> Option<(String, MailOptions)> {
    let rest = line.get("MAIL FROM:".len()..)?.trim();
    let mut parts = rest.split_whitespace();
    let from = strip_angles(parts.next()?)?;

    let mut options = MailOptions::default();
    for parameter in parts {
        if let Some(size) = parameter.strip_prefix_ignore_case("SIZE=") {
            options.size = size.parse().ok();
        } else if parameter.eq_ignore_ascii_case("REQUIRETLS") {
            options.require_tls = true;
        } else if let Some(envelope_id) = parameter.strip_prefix_ignore_case("ENVID=") {
            options.envelope_id = Some(envelope_id.to_string());
        }
        // Unknown parameters are passed over, not rejected.
    }
    Some((from.to_string(), options))
}

/// Parses `RCPT TO:<addr> [NOTIFY=...] [ORCPT=...]`.
fn parse_rcpt_to(line: &str) -> Option<Recipient> {
    let rest = line.get("RCPT TO:".len()..)?.trim();
    let mut parts = rest.split_whitespace();
    let address = strip_angles(parts.next()?)?;

    let mut options = RcptOptions::default();
    for parameter in parts {
        if let Some(notify) = parameter.strip_prefix_ignore_case("NOTIFY=") {
            options.notify = Some(notify.to_string());
        } else if let Some(orcpt) = parameter.strip_prefix_ignore_case("ORCPT=") {
            options.original_recipient = Some(orcpt.to_string());
        }
    }
    Some(Recipient {
        address: address.to_string(),
        options,
    })
}

fn strip_angles(token: &str) -> Option<&str> {
    let address = token.strip_prefix('<')?.strip_suffix('>')?;
    if address.is_empty() {
        return None;
    }
    Some(address)
}

trait StripPrefixIgnoreCase {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str>;
}

impl StripPrefixIgnoreCase for str {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        if self.len() >= prefix.len()
            && self.is_char_boundary(prefix.len())
            && self[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            Some(&self[prefix.len()..])
        } else {
            None
        }
    }
}
