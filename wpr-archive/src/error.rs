use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("archive not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported archive version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("corrupt archive: {0}")]
    Corrupt(&'static str),
    #[error("archive is read-only")]
    ReadOnly,
    #[error("archive was already persisted")]
    AlreadyPersisted,
    #[error("archive size limit of {limit} bytes exceeded")]
    CapacityExceeded { limit: usize },
    #[error("cannot write archive to {path}: {source}")]
    NotWritable { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
