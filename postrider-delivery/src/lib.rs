//! Outbound delivery engine.
//!
//! Consumes the send queue one recipient at a time: resolves the
//! recipient's MX hosts, races the applicable dial strategies per host,
//! runs the SMTP dialog on the winning client and accounts failed attempts
//! with a bounded, delayed retry.

pub mod dial;
pub mod error;
pub mod mx;
pub mod race;
pub mod sender;

pub use dial::Dialer;
pub use error::{DeliveryError, DialError, DnsError};
pub use mx::{DnsMxResolver, MxHost, MxResolver};
pub use race::{race, Close, RaceError};
pub use sender::{Sender, SenderConfig};
