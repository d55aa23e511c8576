//! Scoped resource lifetimes.
//!
//! The replay services alter host state (bound ports, resolver configuration, packet filter
//! rules). Each one is acquired in order and pushed onto a [`ScopeStack`] as a [`Release`]
//! guard. Releasing the stack runs every guard in reverse acquisition order; a failing guard is
//! reported but never prevents the guards below it from running.
//!
//! ```text
//! acquire:  dns ──► http ──► shaper
//! release:  shaper ──► http ──► dns
//! ```

use std::{error::Error as StdError, fmt};

use futures::future::BoxFuture;
use tracing::{debug, error};

/// The future returned by [`Release::release`].
pub type ReleaseFuture = BoxFuture<'static, Result<(), ReleaseError>>;

/// A resource that must be released explicitly when its scope ends.
pub trait Release: Send + 'static {
    /// A short, human readable name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Releases the resource.
    fn release(self: Box<Self>) -> ReleaseFuture;
}

/// An error returned by a guard while releasing its resource.
#[derive(Debug)]
pub struct ReleaseError {
    name: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl ReleaseError {
    pub fn new<E>(name: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self { name, source: source.into() }
    }

    /// The name of the guard that failed.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to release {}: {}", self.name, self.source)
    }
}

impl StdError for ReleaseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A [`Release`] guard built from a closure.
pub struct FnRelease<F> {
    name: &'static str,
    f: F,
}

impl<F> FnRelease<F>
where
    F: FnOnce() -> ReleaseFuture + Send + 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for FnRelease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRelease").field("name", &self.name).finish()
    }
}

impl<F> Release for FnRelease<F>
where
    F: FnOnce() -> ReleaseFuture + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn release(self: Box<Self>) -> ReleaseFuture {
        (self.f)()
    }
}

/// A stack of acquired resources, released last-in first-out.
#[derive(Default)]
pub struct ScopeStack {
    guards: Vec<Box<dyn Release>>,
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.guards.iter().map(|g| g.name()).collect();
        f.debug_struct("ScopeStack").field("guards", &names).finish()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an acquired resource onto the stack. It will be released before every resource
    /// pushed earlier.
    pub fn push<R: Release>(&mut self, guard: R) {
        debug!(name = guard.name(), depth = self.guards.len(), "acquired");
        self.guards.push(Box::new(guard));
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Releases every guard in reverse acquisition order. All guards run, even when an earlier
    /// one fails; the failures are returned in the order they happened.
    pub async fn release_all(&mut self) -> Vec<ReleaseError> {
        let mut errors = Vec::new();

        while let Some(guard) = self.guards.pop() {
            let name = guard.name();
            match guard.release().await {
                Ok(()) => debug!(name, "released"),
                Err(e) => {
                    error!(name, error = %e, "release failed");
                    errors.push(e);
                }
            }
        }

        errors
    }
}

impl Drop for ScopeStack {
    fn drop(&mut self) {
        if !self.guards.is_empty() {
            // Guards restore host state in their own `Drop` as a last resort.
            error!(remaining = self.guards.len(), "scope stack dropped without release_all");
        }

        // Drop in reverse order as well.
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
