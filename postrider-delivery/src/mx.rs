//! MX resolution for recipient domains.

use async_trait::async_trait;
use hickory_resolver::{name_server::TokioConnectionProvider, TokioResolver};
use tracing::debug;

use crate::error::DnsError;

/// One mail exchanger, lowest preference first after sorting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub host: String,
    pub preference: u16,
}

/// MX lookup as consumed by the sender. Swappable so tests can point
/// deliveries at a local mock server.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Returns the domain's mail exchangers sorted by ascending preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or yields no usable hosts.
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError>;
}

/// System-configured DNS resolver.
pub struct DnsMxResolver {
    resolver: TokioResolver,
}

impl DnsMxResolver {
    /// Builds a resolver from the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system configuration cannot be loaded.
    pub fn system() -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?.build();
        Ok(Self { resolver })
    }
}

#[async_trait]
impl MxResolver for DnsMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|source| DnsError::LookupFailed {
                domain: domain.to_string(),
                source,
            })?;

        let mut hosts: Vec<MxHost> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                // DNS names come back fully qualified; the trailing dot is
                // not a valid TLS server name.
                let host = host.trim_end_matches('.').to_string();
                debug!(%host, preference = mx.preference(), "found MX record");
                MxHost {
                    host,
                    preference: mx.preference(),
                }
            })
            .filter(|mx| !mx.host.is_empty())
            .collect();

        if hosts.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }
        hosts.sort_by_key(|mx| mx.preference);
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_sort_by_ascending_preference() {
        let mut hosts = vec![
            MxHost {
                host: "mx3.example.com".to_string(),
                preference: 30,
            },
            MxHost {
                host: "mx1.example.com".to_string(),
                preference: 10,
            },
            MxHost {
                host: "mx2.example.com".to_string(),
                preference: 20,
            },
        ];
        hosts.sort_by_key(|mx| mx.preference);
        assert_eq!(hosts[0].host, "mx1.example.com");
        assert_eq!(hosts[2].host, "mx3.example.com");
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn resolves_real_mx_records() {
        let resolver = DnsMxResolver::system().unwrap();
        let hosts = resolver.lookup_mx("gmail.com").await.unwrap();
        assert!(!hosts.is_empty());
        assert!(hosts.windows(2).all(|w| w[0].preference <= w[1].preference));
    }
}
