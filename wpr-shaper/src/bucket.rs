use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::Bandwidth;

/// A token bucket with zero burst depth.
///
/// The bucket tracks the instant at which the link becomes free. Reserving `n` bytes starts at
/// `max(now, free_at)` and pushes `free_at` forward by the transmission time of `n` bytes, so
/// idle time never banks credit and `B` bytes always take at least `B / R` regardless of how
/// they are split.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: Bandwidth,
    free_at: Option<Instant>,
}

impl TokenBucket {
    pub fn new(rate: Bandwidth) -> Self {
        Self { rate, free_at: None }
    }

    /// Reserves the link for `len` bytes and returns the instant their transmission completes.
    pub fn reserve(&mut self, now: Instant, len: usize) -> Instant {
        if self.rate.is_unlimited() {
            return now;
        }

        let start = self.free_at.map_or(now, |free_at| free_at.max(now));
        let done = start + transmit_time(self.rate, len);
        self.free_at = Some(done);

        done
    }
}

/// Time to send `len` bytes at `rate`, rounded up to the nanosecond.
pub fn transmit_time(rate: Bandwidth, len: usize) -> Duration {
    if rate.is_unlimited() {
        return Duration::ZERO;
    }

    let bits = len as u128 * 8;
    let nanos = (bits * 1_000_000_000).div_ceil(rate.bits_per_sec() as u128);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// A [`TokenBucket`] shared by every connection, used for aggregate limits.
#[derive(Debug, Clone)]
pub struct SharedBucket(Arc<Mutex<TokenBucket>>);

impl SharedBucket {
    pub fn new(rate: Bandwidth) -> Self {
        Self(Arc::new(Mutex::new(TokenBucket::new(rate))))
    }

    pub fn reserve(&self, now: Instant, len: usize) -> Instant {
        self.0.lock().reserve(now, len)
    }
}

/// The budget a connection direction draws from.
#[derive(Debug, Clone)]
pub(crate) enum Limiter {
    Unlimited,
    Own(TokenBucket),
    Shared(SharedBucket),
}

impl Limiter {
    pub(crate) fn reserve(&mut self, now: Instant, len: usize) -> Instant {
        match self {
            Self::Unlimited => now,
            Self::Own(bucket) => bucket.reserve(now, len),
            Self::Shared(bucket) => bucket.reserve(now, len),
        }
    }

    pub(crate) const fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}
