//! Inbound connection policy.

use std::net::IpAddr;

use cidr::IpCidr;

use crate::config::ConfigError;

/// CIDR allowlist applied to submitting peers before the SMTP greeting.
///
/// An empty allowlist admits every peer; a non-empty one admits a peer only
/// when its address falls inside at least one configured network.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPolicy {
    allowed: Vec<IpCidr>,
}

impl ConnectionPolicy {
    /// Parses the configured CIDR ranges.
    ///
    /// # Errors
    ///
    /// Returns a config error for the first range that fails to parse.
    pub fn from_ranges(ranges: &[String]) -> Result<Self, ConfigError> {
        let allowed = ranges
            .iter()
            .map(|range| {
                range.parse::<IpCidr>().map_err(|err| ConfigError::InvalidCidr {
                    range: range.clone(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allowed })
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|net| net.contains(&addr))
    }
}
