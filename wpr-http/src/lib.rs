//! The record and replay HTTP(S) proxy.
//!
//! In replay mode every request is answered from the archive and a request without a recording
//! gets `404 Not Found`, without any network access. In record mode requests missing from the
//! archive are forwarded to their origin, and the response is recorded and relayed.
//!
//! Clients speak either HTTP/1.1 or the multiplexed protocol of `wpr-wire`, chosen once with
//! [`Protocol`]. Both are served in plain text and, optionally, over TLS with certificates
//! minted per host.

use std::{net::SocketAddr, time::Duration};

mod engine;
mod error;
mod http1;
mod mux;
mod origin;
mod request;
mod service;
mod stats;
pub mod tls;

pub use engine::{Reply, NOT_FOUND_BODY};
pub use error::{HttpError, OriginError};
pub use origin::DEFAULT_ORIGIN_ATTEMPTS;
pub use request::{ProxyRequest, GENERATE_PREFIX};
pub use service::{HttpServer, HttpService};
pub use stats::HttpStats;
pub use tls::CertificateAuthority;

/// Default time open connections get to finish when the service shuts down.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// The protocol clients speak, fixed when the service starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Http1,
    /// The multiplexed framing of `wpr-wire`.
    Mux,
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Plain text listener.
    pub http_addr: SocketAddr,
    /// TLS listener, if any.
    pub https_addr: Option<SocketAddr>,
    pub protocol: Protocol,
    /// Insert the determinism script into served HTML.
    pub inject_scripts: bool,
    /// Reproduce the recorded server and chunk delays in replay.
    pub server_delay: bool,
    pub grace_period: Duration,
    /// Connection attempts per origin fetch.
    pub origin_attempts: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 80)),
            https_addr: None,
            protocol: Protocol::Http1,
            inject_scripts: true,
            server_delay: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            origin_attempts: DEFAULT_ORIGIN_ATTEMPTS,
        }
    }
}

impl HttpOptions {
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    pub fn https_addr(mut self, addr: SocketAddr) -> Self {
        self.https_addr = Some(addr);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn inject_scripts(mut self, enabled: bool) -> Self {
        self.inject_scripts = enabled;
        self
    }

    pub fn server_delay(mut self, enabled: bool) -> Self {
        self.server_delay = enabled;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn origin_attempts(mut self, attempts: usize) -> Self {
        self.origin_attempts = attempts;
        self
    }
}
