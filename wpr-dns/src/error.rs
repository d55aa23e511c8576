use std::{io, net::SocketAddr, path::PathBuf};

use hickory_proto::error::ProtoError;
use thiserror::Error;
use wpr_common::command;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("failed to bind DNS socket on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("no nameserver found in {0}")]
    NoNameserver(PathBuf),
    #[error("resolver configuration failed: {0}")]
    Command(#[from] command::Error),
    #[error("unexpected scutil output: {0:?}")]
    Scutil(String),
    #[error("resolver override is not supported on this platform")]
    Unsupported,
    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure to resolve a name through the real resolver.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no address found for {0}")]
    NotFound(String),
    #[error("upstream nameserver {0} did not answer")]
    Timeout(SocketAddr),
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),
}
