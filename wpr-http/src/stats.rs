use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics of the HTTP service, shared by all connections.
#[derive(Debug, Default)]
pub struct HttpStats {
    /// Accepted client connections.
    connections: AtomicUsize,
    /// Requests answered, including errors.
    requests: AtomicUsize,
    /// Requests answered from the archive.
    hits: AtomicUsize,
    /// Requests with no recording.
    misses: AtomicUsize,
    /// Exchanges fetched from origins and recorded.
    recorded: AtomicUsize,
    /// Origin fetches that failed.
    origin_failures: AtomicUsize,
}

impl HttpStats {
    #[inline]
    pub(crate) fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_origin_failures(&self) {
        self.origin_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn origin_failures(&self) -> usize {
        self.origin_failures.load(Ordering::Relaxed)
    }
}
