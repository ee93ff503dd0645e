//! ESMTP parameter rendering for MAIL FROM and RCPT TO.

use std::fmt::Write;

use postrider_common::message::{MailOptions, RcptOptions};

/// Renders the MAIL FROM command with the message's ESMTP parameters.
#[must_use]
pub fn mail_from_command(from: &str, options: Option<&MailOptions>) -> String {
    let mut command = format!("MAIL FROM:<{from}>");
    if let Some(options) = options {
        if let Some(size) = options.size {
            let _ = write!(command, " SIZE={size}");
        }
        if options.require_tls {
            command.push_str(" REQUIRETLS");
        }
        if let Some(envelope_id) = &options.envelope_id {
            let _ = write!(command, " ENVID={envelope_id}");
        }
    }
    command
}

/// Renders the RCPT TO command with the recipient's DSN parameters.
#[must_use]
pub fn rcpt_to_command(to: &str, options: &RcptOptions) -> String {
    let mut command = format!("RCPT TO:<{to}>");
    if let Some(notify) = &options.notify {
        let _ = write!(command, " NOTIFY={notify}");
    }
    if let Some(orcpt) = &options.original_recipient {
        let _ = write!(command, " ORCPT={orcpt}");
    }
    command
}
