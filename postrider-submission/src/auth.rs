//! SASL authentication for the submission session.
//!
//! Supported mechanisms: PLAIN (single base64 blob, optional initial
//! response) and LOGIN (two-step base64 username/password exchange). Both
//! end in the same [`UserStore::authenticate`] call, and every failure is
//! reported to the client identically.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use postrider_common::users::UserStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Result of one AUTH command exchange.
pub(crate) enum AuthOutcome {
    /// The username that authenticated successfully.
    Authenticated(String),
    /// Bad credentials, malformed response or mismatched identity.
    Failed,
    /// The requested SASL mechanism is not offered.
    UnsupportedMechanism,
}

/// Runs the exchange for an `AUTH <mechanism> [initial-response]` line.
/// The caller writes the final 235/535 reply.
pub(crate) async fn handle_auth<R, W>(
    reader: &mut R,
    writer: &mut W,
    line: &str,
    users: &dyn UserStore,
) -> std::io::Result<AuthOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parts = line.split_whitespace();
    let _auth = parts.next();
    let Some(mechanism) = parts.next() else {
        return Ok(AuthOutcome::Failed);
    };
    let initial = parts.next();

    match mechanism.to_ascii_uppercase().as_str() {
        "PLAIN" => plain(reader, writer, initial, users).await,
        "LOGIN" => login(reader, writer, initial, users).await,
        _ => Ok(AuthOutcome::UnsupportedMechanism),
    }
}

async fn plain<R, W>(
    reader: &mut R,
    writer: &mut W,
    initial: Option<&str>,
    users: &dyn UserStore,
) -> std::io::Result<AuthOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let blob = match initial {
        Some(blob) => blob.to_string(),
        None => challenge(reader, writer, "334 ").await?,
    };
    let Ok(decoded) = BASE64.decode(blob.as_bytes()) else {
        return Ok(AuthOutcome::Failed);
    };

    // identity NUL username NUL password
    let mut fields = decoded.split(|&b| b == 0);
    let (Some(identity), Some(username), Some(password)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Ok(AuthOutcome::Failed);
    };
    let identity = String::from_utf8_lossy(identity);
    let username = String::from_utf8_lossy(username).into_owned();
    let password = String::from_utf8_lossy(password);

    if !identity.is_empty() && identity != username {
        warn!("PLAIN identity does not match username");
        return Ok(AuthOutcome::Failed);
    }

    if users.authenticate(&username, &password).is_err() {
        return Ok(AuthOutcome::Failed);
    }
    Ok(AuthOutcome::Authenticated(username))
}

async fn login<R, W>(
    reader: &mut R,
    writer: &mut W,
    initial: Option<&str>,
    users: &dyn UserStore,
) -> std::io::Result<AuthOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let username = match initial {
        Some(blob) => blob.to_string(),
        // "Username:"
        None => challenge(reader, writer, "334 VXNlcm5hbWU6").await?,
    };
    let Ok(username) = BASE64.decode(username.as_bytes()) else {
        return Ok(AuthOutcome::Failed);
    };
    let username = String::from_utf8_lossy(&username).into_owned();

    // "Password:"
    let password = challenge(reader, writer, "334 UGFzc3dvcmQ6").await?;
    let Ok(password) = BASE64.decode(password.as_bytes()) else {
        return Ok(AuthOutcome::Failed);
    };
    let password = String::from_utf8_lossy(&password);

    if users.authenticate(&username, &password).is_err() {
        return Ok(AuthOutcome::Failed);
    }
    Ok(AuthOutcome::Authenticated(username))
}

/// Sends a 334 challenge and reads the client's one-line response.
async fn challenge<R, W>(reader: &mut R, writer: &mut W, prompt: &str) -> std::io::Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(prompt.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
