use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming, client::conn::http1, server::conn::http1 as server, service::service_fn,
    HeaderMap, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use wpr_dns::{HostResolver, LookupError};

pub const PAGE: &[u8] = b"<html><head><title>t</title></head><body>hello</body></html>";
pub const DATA: &[u8] = b"{\"answer\":42}";

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Resolves every name to the loopback address, where the test origin listens.
#[derive(Debug)]
pub struct Loopback;

#[async_trait]
impl HostResolver for Loopback {
    async fn resolve(&self, _host: &str) -> Result<IpAddr, LookupError> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// A tiny origin server counting the connections it accepts.
pub struct Origin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Origin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(localhost()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = server::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(handle))
                        .await;
                });
            }
        });

        Self { addr, connections, task }
    }

    /// The `Host` that reaches this origin through [`Loopback`].
    pub fn host(&self) -> String {
        format!("origin.test:{}", self.addr.port())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let builder = Response::builder();
    let response = match request.uri().path() {
        "/page" => builder
            .header("content-type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(PAGE))),
        "/data.json" => builder
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(DATA))),
        "/echo" => {
            let body =
                request.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            builder.header("content-type", "text/plain").body(Full::new(body))
        }
        _ => builder.status(404).body(Full::new(Bytes::from_static(b"origin has nothing"))),
    };

    Ok(response.unwrap())
}

/// Sends one request on a fresh connection.
pub async fn send<Io>(io: Io, request: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes)
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await.unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
}

pub async fn get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    let request = Request::get(path).header("host", host).body(Full::new(Bytes::new())).unwrap();
    send(TcpStream::connect(addr).await.unwrap(), request).await
}

pub async fn post(
    addr: SocketAddr,
    host: &str,
    path: &str,
    body: &'static [u8],
) -> (StatusCode, HeaderMap, Bytes) {
    let request =
        Request::post(path).header("host", host).body(Full::new(Bytes::from_static(body))).unwrap();
    send(TcpStream::connect(addr).await.unwrap(), request).await
}
