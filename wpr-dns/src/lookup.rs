use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RData, RecordType},
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, trace};

use crate::{classify::is_local_name, LookupError};

/// Default time to wait for one upstream answer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default number of attempts per query.
pub const DEFAULT_ATTEMPTS: usize = 3;

const MAX_DATAGRAM: usize = 4096;

/// Resolves hostnames against the real network.
///
/// Handed to the HTTP service so record mode can reach origins even though the host resolver
/// points at the DNS proxy.
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> Result<IpAddr, LookupError>;
}

/// Queries the system's original nameserver directly over UDP.
///
/// Every successful answer refreshes a per-process map, which is consulted only when the
/// upstream stops answering.
#[derive(Debug)]
pub struct RealDnsLookup {
    upstream: SocketAddr,
    timeout: Duration,
    attempts: usize,
    cache: RwLock<FxHashMap<String, IpAddr>>,
}

impl RealDnsLookup {
    /// Creates a lookup that asks `upstream`. A port of 0 means 53.
    pub fn new(upstream: SocketAddr) -> Self {
        let upstream = match upstream.port() {
            0 => SocketAddr::new(upstream.ip(), 53),
            _ => upstream,
        };

        Self {
            upstream,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            cache: RwLock::default(),
        }
    }

    /// Sets the time to wait for each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of attempts per query (at least one).
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Returns the last address resolved for `host`.
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        self.cache.read().get(&host.to_ascii_lowercase()).copied()
    }

    /// Sends a raw query upstream and returns the raw answer, untouched.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, LookupError> {
        let id = match query {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => return Err(LookupError::NotFound("<empty query>".to_string())),
        };

        self.exchange(query, id).await
    }

    async fn exchange(&self, query: &[u8], id: u16) -> Result<Vec<u8>, LookupError> {
        let local: SocketAddr = match self.upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.upstream).await?;

        let mut buf = vec![0; MAX_DATAGRAM];
        for attempt in 1..=self.attempts {
            socket.send(query).await?;

            // Stale answers to earlier attempts carry the same id and are just as good.
            let recv = async {
                loop {
                    let len = socket.recv(&mut buf).await?;
                    if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                        return Ok::<_, std::io::Error>(len);
                    }
                    trace!(len, "ignoring unrelated datagram");
                }
            };

            match timeout(self.timeout, recv).await {
                Ok(len) => return Ok(buf[..len?].to_vec()),
                Err(_) => debug!(upstream = %self.upstream, attempt, "DNS query timed out"),
            }
        }

        Err(LookupError::Timeout(self.upstream))
    }

    async fn query(
        &self,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Option<IpAddr>, LookupError> {
        let id = rand::random::<u16>();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), record_type));

        let reply = self.exchange(&message.to_vec()?, id).await?;
        let reply = Message::from_vec(&reply)?;

        Ok(reply.answers().iter().find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        }))
    }

    async fn lookup(&self, host: &str) -> Result<IpAddr, LookupError> {
        let mut name = Name::from_ascii(host)?;
        name.set_fqdn(true);

        for record_type in [RecordType::A, RecordType::AAAA] {
            if let Some(ip) = self.query(&name, record_type).await? {
                return Ok(ip);
            }
        }

        Err(LookupError::NotFound(host.to_string()))
    }
}

#[async_trait]
impl HostResolver for RealDnsLookup {
    async fn resolve(&self, host: &str) -> Result<IpAddr, LookupError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if is_local_name(&host) {
            return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        match self.lookup(&host).await {
            Ok(ip) => {
                self.cache.write().insert(host, ip);
                Ok(ip)
            }
            Err(LookupError::Timeout(upstream)) => {
                self.cached(&host).ok_or(LookupError::Timeout(upstream))
            }
            Err(e) => Err(e),
        }
    }
}

/// Extracts the first `nameserver` of a `resolv.conf` file.
pub fn nameserver_from_resolv_conf(contents: &str) -> Option<IpAddr> {
    contents.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("nameserver"), Some(addr)) => addr.parse().ok(),
            _ => None,
        }
    })
}
