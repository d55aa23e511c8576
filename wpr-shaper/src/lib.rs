//! Traffic shaping for replayed connections.
//!
//! Every connection accepted by the proxy is wrapped in a [`ShapedStream`], which enforces the
//! configured bandwidth, propagation delay and loss independently per direction. With
//! [`ShaperConfig::aggregate`] both directions draw from budgets shared by all connections.
//! [`hooks`] redirects the host's standard ports to the proxy.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

mod bandwidth;
mod bucket;
mod config;
mod error;
pub mod hooks;
mod stream;

pub use bandwidth::Bandwidth;
pub use bucket::{transmit_time, SharedBucket, TokenBucket};
pub use config::ShaperConfig;
pub use error::{ConfigError, HookError};
pub use stream::{ShapedStats, ShapedStream};

use bucket::Limiter;
use stream::Lane;

#[derive(Debug)]
struct Shared {
    config: ShaperConfig,
    /// Aggregate budgets (up, down), when configured.
    aggregate: Option<(SharedBucket, SharedBucket)>,
    /// Connections wrapped so far, used to derive per-connection seeds.
    connections: AtomicU64,
    /// Loss decisions for datagrams.
    datagram_rng: Mutex<StdRng>,
}

/// A cheaply cloneable handle that applies one [`ShaperConfig`] to many connections.
#[derive(Debug, Clone)]
pub struct TrafficShaper {
    shared: Arc<Shared>,
}

impl Default for TrafficShaper {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TrafficShaper {
    /// Creates a shaper after validating `config`.
    pub fn new(config: ShaperConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let aggregate = config
            .aggregate
            .then(|| (SharedBucket::new(config.up), SharedBucket::new(config.down)));

        let datagram_rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                aggregate,
                connections: AtomicU64::new(0),
                datagram_rng: Mutex::new(datagram_rng),
            }),
        })
    }

    /// A shaper that lets everything through untouched.
    pub fn disabled() -> Self {
        Self {
            shared: Arc::new(Shared {
                config: ShaperConfig::default(),
                aggregate: None,
                connections: AtomicU64::new(0),
                datagram_rng: Mutex::new(StdRng::seed_from_u64(0)),
            }),
        }
    }

    pub fn config(&self) -> &ShaperConfig {
        &self.shared.config
    }

    pub fn is_enabled(&self) -> bool {
        !self.shared.config.is_noop()
    }

    /// Wraps a client connection.
    pub fn wrap<Io>(&self, io: Io) -> ShapedStream<Io> {
        let config = &self.shared.config;
        let index = self.shared.connections.fetch_add(1, Ordering::Relaxed);

        let limiter = |rate: Bandwidth, shared: Option<&SharedBucket>| match shared {
            _ if rate.is_unlimited() => Limiter::Unlimited,
            Some(bucket) => Limiter::Shared(bucket.clone()),
            None => Limiter::Own(TokenBucket::new(rate)),
        };

        let (up_shared, down_shared) = match &self.shared.aggregate {
            Some((up, down)) => (Some(up), Some(down)),
            None => (None, None),
        };

        let delay = config.one_way_delay();
        let up = Lane::new(limiter(config.up, up_shared), delay, config.packet_loss);
        let down = Lane::new(limiter(config.down, down_shared), delay, config.packet_loss);

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ index),
            None => StdRng::from_entropy(),
        };

        ShapedStream::new(io, up, down, rng)
    }

    /// Total delay to apply to a datagram exchange (query and reply).
    pub fn datagram_delay(&self) -> Duration {
        self.shared.config.delay
    }

    /// Decides whether a datagram is lost.
    pub fn drop_datagram(&self) -> bool {
        let loss = self.shared.config.packet_loss;
        loss > 0.0 && self.shared.datagram_rng.lock().gen::<f64>() < loss
    }
}
