use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{client::conn::http1, header::HOST, Request};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{timeout, Instant},
};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use wpr_archive::{RecordedResponse, Scheme, Timing};
use wpr_dns::HostResolver;

use crate::{
    request::{is_hop_by_hop, ProxyRequest},
    tls, OriginError,
};

/// Default number of connection attempts per request.
pub const DEFAULT_ORIGIN_ATTEMPTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Sender = http1::SendRequest<Full<Bytes>>;

/// Fetches responses from the real origins while recording.
pub(crate) struct OriginClient {
    resolver: Arc<dyn HostResolver>,
    tls: TlsConnector,
    attempts: usize,
}

impl std::fmt::Debug for OriginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginClient").field("attempts", &self.attempts).finish()
    }
}

impl OriginClient {
    pub(crate) fn new(resolver: Arc<dyn HostResolver>, attempts: usize) -> Self {
        Self {
            resolver,
            tls: TlsConnector::from(Arc::new(tls::insecure_client_config())),
            attempts: attempts.max(1),
        }
    }

    /// Forwards `request` to its origin and captures the whole response with its timing.
    /// Connection failures are retried, failures after the request was sent are not.
    pub(crate) async fn fetch(
        &self,
        request: &ProxyRequest,
    ) -> Result<RecordedResponse, OriginError> {
        let (host, port) = request.origin();
        let addr = SocketAddr::new(self.resolver.resolve(host).await?, port);

        let mut attempt = 1;
        let sender = loop {
            match self.connect(addr, host, request.scheme).await {
                Ok(sender) => break sender,
                Err(e) if attempt < self.attempts => {
                    debug!(%addr, attempt, error = %e, "origin connection failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.exchange(sender, request).await
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        host: &str,
        scheme: Scheme,
    ) -> Result<Sender, OriginError> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OriginError::Timeout(addr))??;
        tcp.set_nodelay(true)?;

        match scheme {
            Scheme::Http => handshake(tcp).await,
            Scheme::Https => {
                let name = rustls::ServerName::try_from(host)
                    .map_err(|_| OriginError::InvalidHost(host.to_string()))?;
                handshake(self.tls.connect(name, tcp).await?).await
            }
        }
    }

    async fn exchange(
        &self,
        mut sender: Sender,
        request: &ProxyRequest,
    ) -> Result<RecordedResponse, OriginError> {
        let mut builder =
            Request::builder().method(request.method.as_str()).uri(request.path_and_query.as_str());

        for (name, value) in request.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
            builder = builder.header(name.as_str(), &value[..]);
        }

        if request.header(HOST.as_str()).is_none() {
            builder = builder.header(HOST, request.authority.as_str());
        }

        let started = Instant::now();
        let response = sender.send_request(builder.body(Full::new(request.body.clone()))?).await?;
        let server_delay = started.elapsed();

        let mut recorded = RecordedResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            let value = Bytes::copy_from_slice(value.as_bytes());
            recorded.headers.push((name.as_str().to_string(), value));
        }

        let mut body = response.into_body();
        let mut chunk_delays = Vec::new();
        let mut last = Instant::now();

        while let Some(frame) = body.frame().await {
            let Ok(chunk) = frame?.into_data() else { continue };
            if chunk.is_empty() {
                continue;
            }

            let now = Instant::now();
            if !recorded.chunks.is_empty() {
                chunk_delays.push(now - last);
            }
            last = now;
            recorded.chunks.push(chunk);
        }

        trace!(status = recorded.status, chunks = recorded.chunks.len(), ?server_delay, "fetched");
        recorded.timing = Timing { server_delay, chunk_delays };

        Ok(recorded)
    }
}

async fn handshake<Io>(io: Io) -> Result<Sender, OriginError>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "origin connection closed");
        }
    });

    Ok(sender)
}
