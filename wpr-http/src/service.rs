use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wpr_archive::{ArchiveError, ArchiveStore, Injector, Scheme};
use wpr_common::scope::{Release, ReleaseError, ReleaseFuture};
use wpr_dns::HostResolver;
use wpr_shaper::{ShapedStream, TrafficShaper};

use crate::{
    engine::Engine, http1, mux, origin::OriginClient, stats::HttpStats, tls, CertificateAuthority,
    HttpError, HttpOptions, Protocol,
};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds and binds the HTTP service.
pub struct HttpServer {
    options: HttpOptions,
    store: Arc<ArchiveStore>,
    resolver: Option<Arc<dyn HostResolver>>,
    shaper: TrafficShaper,
    ca: Option<Arc<CertificateAuthority>>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("options", &self.options)
            .field("store", &self.store)
            .finish()
    }
}

impl HttpServer {
    /// Serves `store`: replays a frozen store, records into a recording one.
    pub fn new(options: HttpOptions, store: Arc<ArchiveStore>) -> Self {
        Self { options, store, resolver: None, shaper: TrafficShaper::disabled(), ca: None }
    }

    /// Sets the resolver used to reach origins. Required for recording.
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the shaper applied to every client connection.
    pub fn shaper(mut self, shaper: TrafficShaper) -> Self {
        self.shaper = shaper;
        self
    }

    /// Sets the authority signing the TLS listener's certificates. One is generated otherwise.
    pub fn certificate_authority(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Binds the listeners and starts accepting connections.
    pub async fn bind(self) -> Result<HttpService, HttpError> {
        let origin = match (self.store.is_recording(), self.resolver) {
            (true, Some(resolver)) => {
                Some(OriginClient::new(resolver, self.options.origin_attempts))
            }
            (true, None) => return Err(HttpError::NoResolver),
            (false, _) => None,
        };

        let http = bind(self.options.http_addr).await?;
        let https = match self.options.https_addr {
            Some(addr) => {
                let ca = match self.ca {
                    Some(ca) => ca,
                    None => Arc::new(CertificateAuthority::generate()?),
                };
                let config = tls::server_config(Arc::clone(&ca), self.options.protocol);
                let acceptor = TlsAcceptor::from(config);
                Some((bind(addr).await?, acceptor, ca))
            }
            None => None,
        };

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let stats = Arc::new(HttpStats::default());
        let engine = Arc::new(Engine::new(
            self.store,
            origin,
            self.options.inject_scripts.then(Injector::deterministic),
            self.options.server_delay,
            fatal_tx,
            Arc::clone(&stats),
        ));

        let context = Arc::new(Context {
            engine,
            shaper: self.shaper,
            protocol: self.options.protocol,
            grace_period: self.options.grace_period,
        });

        let cancel = CancellationToken::new();
        let mut listeners = JoinSet::new();

        let http_addr = http.local_addr()?;
        listeners.spawn(accept(http, None, Arc::clone(&context), cancel.clone()));
        info!(addr = %http_addr, protocol = ?context.protocol, "HTTP service listening");

        let (https_addr, ca) = match https {
            Some((listener, acceptor, ca)) => {
                let addr = listener.local_addr()?;
                info!(%addr, protocol = ?context.protocol, "HTTPS service listening");
                let context = Arc::clone(&context);
                listeners.spawn(accept(listener, Some(acceptor), context, cancel.clone()));
                (Some(addr), Some(ca))
            }
            None => (None, None),
        };

        Ok(HttpService {
            http_addr,
            https_addr,
            ca,
            cancel,
            listeners,
            fatal: Some(fatal_rx),
            stats,
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, HttpError> {
    TcpListener::bind(addr).await.map_err(|source| HttpError::Bind { addr, source })
}

/// State shared by the connections of every listener.
struct Context {
    engine: Arc<Engine>,
    shaper: TrafficShaper,
    protocol: Protocol,
    grace_period: Duration,
}

/// Accepts connections until cancelled, then gives the open ones the grace period to finish
/// before aborting them.
async fn accept(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: Arc<Context>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    context.engine.stats().increment_connections();
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }

                    let io = context.shaper.wrap(stream);
                    let context = Arc::clone(&context);
                    connections.spawn(connection(io, peer, tls.clone(), context, cancel.clone()));
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
        }
    }

    drop(listener);

    let drained = timeout(context.grace_period, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(remaining = connections.len(), "grace period over, closing connections");
        connections.shutdown().await;
    }
}

async fn connection(
    io: ShapedStream<TcpStream>,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    context: Arc<Context>,
    cancel: CancellationToken,
) {
    debug!(%peer, "accepted connection");

    let Some(acceptor) = tls else {
        return serve(io, Scheme::Http, &context, cancel).await;
    };

    match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(io)).await {
        Ok(Ok(stream)) => serve(stream, Scheme::Https, &context, cancel).await,
        Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
        Err(_) => debug!(%peer, "TLS handshake timed out"),
    }
}

async fn serve<Io>(io: Io, scheme: Scheme, context: &Context, cancel: CancellationToken)
where
    Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let engine = Arc::clone(&context.engine);
    match context.protocol {
        Protocol::Http1 => http1::serve(io, scheme, engine, cancel).await,
        Protocol::Mux => mux::serve(io, scheme, engine, cancel).await,
    }
}

/// A running HTTP service. Listeners close on [`HttpService::shutdown`], on [`Release`] and on
/// drop.
#[derive(Debug)]
pub struct HttpService {
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    ca: Option<Arc<CertificateAuthority>>,
    cancel: CancellationToken,
    listeners: JoinSet<()>,
    fatal: Option<mpsc::Receiver<ArchiveError>>,
    stats: Arc<HttpStats>,
}

impl HttpService {
    pub fn local_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The address of the TLS listener, if any.
    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// The authority signing the TLS listener's certificates.
    pub fn certificate_authority(&self) -> Option<&Arc<CertificateAuthority>> {
        self.ca.as_ref()
    }

    pub fn stats(&self) -> Arc<HttpStats> {
        Arc::clone(&self.stats)
    }

    /// Takes the channel on which a failed archive write is reported. The run must stop when it
    /// yields.
    pub fn take_fatal(&mut self) -> Option<mpsc::Receiver<ArchiveError>> {
        self.fatal.take()
    }

    /// Stops accepting, waits for open connections up to the grace period, then closes them.
    pub async fn shutdown(mut self) -> Result<(), HttpError> {
        self.cancel.cancel();
        while let Some(res) = self.listeners.join_next().await {
            res?;
        }

        info!(addr = %self.http_addr, requests = self.stats.requests(), "HTTP service closed");
        Ok(())
    }
}

impl Drop for HttpService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Release for HttpService {
    fn name(&self) -> &'static str {
        "http"
    }

    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move { self.shutdown().await.map_err(|e| ReleaseError::new("http", e)) })
    }
}
