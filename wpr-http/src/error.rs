use std::{io, net::SocketAddr};

use thiserror::Error;
use wpr_dns::LookupError;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("recording requires a host resolver")]
    NoResolver,
    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure to fetch a response from the origin while recording.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to resolve origin: {0}")]
    Resolve(#[from] LookupError),
    #[error("failed to connect to origin: {0}")]
    Connect(#[from] io::Error),
    #[error("connecting to origin {0} timed out")]
    Timeout(SocketAddr),
    #[error("invalid origin host {0:?}")]
    InvalidHost(String),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}
