//! Command-level SMTP client over an established connection.

use std::sync::Arc;

use postrider_common::message::{MailOptions, RcptOptions};
use tokio_rustls::rustls::ClientConfig;

use crate::{
    connection::ClientConnection,
    error::{ClientError, Result},
    params,
    response::Response,
};

/// Initial size of the read buffer for SMTP replies.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on the reply buffer to keep a hostile server from growing it
/// without limit (1 MiB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client for sending commands and reading replies.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_host: String,
}

impl SmtpClient {
    /// Wraps an already established connection. The server greeting has not
    /// been read yet; call [`SmtpClient::read_greeting`] first.
    #[must_use]
    pub fn new(connection: ClientConnection, server_host: impl Into<String>) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_host: server_host.into(),
        }
    }

    /// Reads the initial 220 greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is negative.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let greeting = self.read_response().await?;
        if !greeting.is_success() {
            return Err(greeting.into_error());
        }
        Ok(greeting)
    }

    /// Sends a raw command line and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let data = format!("{command}\r\n");
        let connection = self.connection()?;
        connection.send(data.as_bytes()).await?;
        connection.flush().await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, options: Option<&MailOptions>) -> Result<Response> {
        self.command(&params::mail_from_command(from, options)).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str, options: &RcptOptions) -> Result<Response> {
        self.command(&params::rcpt_to_command(to, options)).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Writes the message body, dot-stuffed, terminated with `CRLF.CRLF`,
    /// and reads the final reply. The complete body is always transmitted.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the reply cannot be read.
    pub async fn send_data(&mut self, body: &[u8]) -> Result<Response> {
        let payload = dot_stuff(body);
        let connection = self.connection()?;
        connection.send(&payload).await?;
        if !payload.ends_with(b"\r\n") {
            connection.send(b"\r\n").await?;
        }
        connection.send(b".\r\n").await?;
        connection.flush().await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and upgrades the connection on a positive reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects STARTTLS or the TLS handshake
    /// fails.
    pub async fn starttls(&mut self, config: Arc<ClientConfig>) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        let host = self.server_host.clone();
        self.connection = Some(connection.upgrade_to_tls(config, &host).await?);
        Ok(response)
    }

    /// Tears the connection down without the QUIT dance. Used for surplus
    /// clients from the dial race and after dialog errors.
    pub async fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    #[must_use]
    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    fn connection(&mut self) -> Result<&mut ClientConnection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Duplicates every leading dot so body lines cannot terminate the DATA
/// phase early (RFC 5321 section 4.5.2).
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut at_line_start = true;
    for &byte in body {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_duplicates_leading_dots() {
        assert_eq!(dot_stuff(b"hello\r\n.\r\nworld\r\n"), b"hello\r\n..\r\nworld\r\n");
        assert_eq!(dot_stuff(b".start\r\n"), b"..start\r\n");
        assert_eq!(dot_stuff(b"mid.dle\r\n"), b"mid.dle\r\n");
        assert_eq!(dot_stuff(b""), b"");
    }
}
