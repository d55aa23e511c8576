use std::time::Duration;

use crate::{Bandwidth, ConfigError};

/// Network conditions to emulate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaperConfig {
    /// Client to proxy cap.
    pub up: Bandwidth,
    /// Proxy to client cap.
    pub down: Bandwidth,
    /// Round-trip propagation delay, split evenly between both directions.
    pub delay: Duration,
    /// Probability in `[0, 1]` that a write is dropped.
    pub packet_loss: f64,
    /// Share one budget per direction across all connections instead of one per connection.
    pub aggregate: bool,
    /// Seed for loss decisions. Random when unset.
    pub seed: Option<u64>,
}

impl ShaperConfig {
    pub fn up(mut self, up: Bandwidth) -> Self {
        self.up = up;
        self
    }

    pub fn down(mut self, down: Bandwidth) -> Self {
        self.down = down;
        self
    }

    /// Sets the round-trip delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn packet_loss(mut self, packet_loss: f64) -> Self {
        self.packet_loss = packet_loss;
        self
    }

    pub fn aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the values that cannot be enforced by the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.packet_loss) {
            return Err(ConfigError::PacketLoss(self.packet_loss));
        }

        Ok(())
    }

    /// Returns `true` if this configuration changes nothing.
    pub fn is_noop(&self) -> bool {
        self.up.is_unlimited() &&
            self.down.is_unlimited() &&
            self.delay.is_zero() &&
            self.packet_loss == 0.0
    }

    /// The delay applied in each direction.
    #[inline]
    pub fn one_way_delay(&self) -> Duration {
        self.delay / 2
    }
}
