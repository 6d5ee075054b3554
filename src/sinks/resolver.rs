//! Verify-mode lookups against a zone's own server.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;

use super::dns::Resolver;
use crate::error::{Error, Result};

const DNS_PORT: u16 = 53;

/// Queries the named server directly, bypassing any cache, so the answer
/// reflects what the zone currently publishes.
pub struct HickoryResolver {
    timeout: Duration,
}

impl HickoryResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn opts(&self) -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        opts
    }

    /// `server` may be an address, an address with port or a hostname.
    async fn server_addrs(&self, server: &str) -> Result<Vec<SocketAddr>> {
        if let Some(addr) = parse_addr(server) {
            return Ok(vec![addr]);
        }
        let system = TokioAsyncResolver::tokio_from_system_conf()?;
        let lookup = system.lookup_ip(server).await?;
        Ok(lookup.iter().map(|ip| SocketAddr::new(ip, DNS_PORT)).collect())
    }
}

fn parse_addr(server: &str) -> Option<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Some(addr);
    }
    server
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve(&self, server: &str, record_type: &str, name: &str) -> Result<Vec<String>> {
        let rtype = RecordType::from_str(&record_type.to_ascii_uppercase())
            .map_err(|_| Error::RecordType(record_type.to_string()))?;

        let mut servers = NameServerConfigGroup::new();
        for addr in self.server_addrs(server).await? {
            servers.push(NameServerConfig::new(addr, Protocol::Udp));
            servers.push(NameServerConfig::new(addr, Protocol::Tcp));
        }
        if servers.is_empty() {
            return Err(Error::Unavailable(format!("no address for server {}", server)));
        }

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], servers), self.opts());
        match resolver.lookup(fqdn(name), rtype).await {
            Ok(lookup) => Ok(lookup.iter().map(|rdata| rdata.to_string()).collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
