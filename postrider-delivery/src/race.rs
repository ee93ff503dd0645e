//! Race several attempts at producing a closeable resource.
//!
//! All attempts run concurrently; the first success is handed to the caller
//! un-closed, every later success is closed by a background drain task, and
//! if all attempts fail the errors are aggregated. Dropping the race future
//! never leaks resources: an attempt whose result can no longer be
//! delivered closes it itself.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A resource that must be released when it loses the race.
#[async_trait]
pub trait Close: Send {
    async fn close(self);
}

#[derive(Debug, Error)]
pub enum RaceError<E: fmt::Debug + fmt::Display> {
    #[error("no attempts to race")]
    NoAttempts,

    #[error("all attempts failed: {}", format_errors(.0))]
    AllFailed(Vec<E>),
}

fn format_errors<E: fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs every attempt concurrently and returns the first success.
///
/// The attempts are spawned as soon as `race` is called; dropping the
/// returned future does not cancel them, it only means their successes are
/// closed instead of delivered.
///
/// # Errors
///
/// Returns [`RaceError::AllFailed`] with every attempt's error when no
/// attempt succeeds, and [`RaceError::NoAttempts`] for an empty input.
pub fn race<T, E, F>(
    attempts: Vec<F>,
) -> impl std::future::Future<Output = Result<T, RaceError<E>>> + Send
where
    T: Close + Send + 'static,
    E: fmt::Debug + fmt::Display + Send + 'static,
    F: std::future::Future<Output = Result<T, E>> + Send + 'static,
{
    let total = attempts.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));
    for attempt in attempts {
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = attempt.await;
            if let Err(unsent) = tx.send(result).await {
                // Receiver is gone; a success would leak unless closed here.
                if let Ok(resource) = unsent.0 {
                    resource.close().await;
                }
            }
        });
    }
    drop(tx);

    async move {
        if total == 0 {
            return Err(RaceError::NoAttempts);
        }
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(winner) => {
                    tokio::spawn(async move {
                        while let Some(result) = rx.recv().await {
                            if let Ok(surplus) = result {
                                surplus.close().await;
                            }
                        }
                    });
                    return Ok(winner);
                }
                Err(err) => errors.push(err),
            }
        }
        Err(RaceError::AllFailed(errors))
    }
}
