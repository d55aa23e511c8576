use std::error::Error as StdError;

use thiserror::Error;
use wpr_archive::ArchiveError;
use wpr_common::scope::ReleaseError;

use crate::config::ConfigError;

/// Exit code of invalid invocations.
pub(crate) const EXIT_CONFIG: u8 = 2;
/// Exit code of every other failure.
pub(crate) const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to acquire {resource}: {source}")]
    Acquire {
        resource: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("recording failed: {0}")]
    Fatal(#[source] ArchiveError),
    #[error("{} resource(s) failed to release", .0.len())]
    Release(Vec<ReleaseError>),
}

impl Error {
    /// Returns a closure wrapping an error into [`Error::Acquire`], for `map_err`.
    pub(crate) fn acquire<E>(resource: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |e| Self::Acquire { resource, source: e.into() }
    }

    pub(crate) const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}
