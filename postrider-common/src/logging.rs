//! Structured logging for the relay.
//!
//! Every stage logs through [`tracing`] with a consistent field set so a
//! message can be followed from submission to delivery: `envelope_id`,
//! `from`, `to`, `stage` and, where available, the remote address.

use chrono::Utc;
use tracing::{metadata::LevelFilter, Span};
use tracing_subscriber::{
    filter::FilterFn, fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

use crate::message::{QueuedMessage, ReceivedMessage};

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_fmt(format_args!("{}", Utc::now().to_rfc3339()))
    }
}

/// Installs the global subscriber. Call once, early in main.
pub fn init(level: &str) {
    let level = parse_level(level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(Time)
                .with_target(false)
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("postrider")
                })),
        )
        .init();
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Span covering the preprocessing of one received message.
pub fn receive_span(msg: &ReceivedMessage) -> Span {
    tracing::info_span!(
        "process",
        stage = "preprocessing",
        envelope_id = %msg.envelope_id(),
        from = %msg.from,
        recipients = msg.recipients.len(),
    )
}

/// Span covering one delivery attempt of a queued message.
///
/// Tolerates absent mail options; the envelope id then logs as `na`.
pub fn delivery_span(msg: &QueuedMessage) -> Span {
    tracing::info_span!(
        "deliver",
        stage = "delivery",
        envelope_id = %msg.envelope_id(),
        from = %msg.from,
        to = %msg.to,
    )
}
