//! DNS interception for record and replay runs.
//!
//! Every public name resolves to the proxy, so browsers send all their traffic to it. Names that
//! really resolve to private or local addresses are passed through to the original nameserver,
//! unless that is disabled.

use std::net::IpAddr;

use rustc_hash::FxHashSet;

pub mod classify;
mod error;
mod handler;
mod lookup;
pub mod resolver;
mod server;

pub use error::{DnsError, LookupError};
pub use handler::DnsHandler;
pub use lookup::{
    nameserver_from_resolv_conf, HostResolver, RealDnsLookup, DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT,
};
pub use resolver::ResolverOverride;
pub use server::{DnsServer, DnsService};

/// TTL of the records pointing at the proxy.
pub const DEFAULT_TTL: u32 = 60;

/// Options for the DNS proxy.
#[derive(Debug, Clone)]
pub struct DnsOptions {
    /// The address answered for public names.
    pub proxy_ip: IpAddr,
    /// Whether private names are answered by the real nameserver.
    pub private_passthrough: bool,
    /// Names that always resolve to the proxy, lower-cased without trailing dot.
    pub skip_hosts: FxHashSet<String>,
    /// TTL of the answers, in seconds.
    pub ttl: u32,
}

impl DnsOptions {
    pub fn new(proxy_ip: IpAddr) -> Self {
        Self {
            proxy_ip,
            private_passthrough: true,
            skip_hosts: FxHashSet::default(),
            ttl: DEFAULT_TTL,
        }
    }

    /// Sets whether private names are passed through. Disabling this sends traffic meant for
    /// local infrastructure to the proxy.
    pub fn private_passthrough(mut self, enabled: bool) -> Self {
        self.private_passthrough = enabled;
        self
    }

    /// Names that must never be passed through, typically the hosts of the archive.
    pub fn skip_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skip_hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim_end_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}
