use std::{net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wpr_common::scope::{Release, ReleaseError, ReleaseFuture};
use wpr_shaper::TrafficShaper;

use crate::{DnsError, DnsHandler};

const MAX_DATAGRAM: usize = 4096;

/// A bound DNS proxy socket, not yet serving.
#[derive(Debug)]
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    shaper: TrafficShaper,
}

impl DnsServer {
    /// Binds the proxy socket. Replies are delayed and dropped by `shaper`.
    pub async fn bind(
        addr: SocketAddr,
        handler: DnsHandler,
        shaper: TrafficShaper,
    ) -> Result<Self, DnsError> {
        let socket =
            UdpSocket::bind(addr).await.map_err(|source| DnsError::Bind { addr, source })?;

        Ok(Self { socket: Arc::new(socket), handler: Arc::new(handler), shaper })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.socket.local_addr()?)
    }

    /// Starts serving in a background task.
    pub fn spawn(self) -> Result<DnsService, DnsError> {
        let local_addr = self.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));

        info!(%local_addr, "DNS proxy listening");

        Ok(DnsService { local_addr, cancel, task: Some(task) })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut buf = vec![0; MAX_DATAGRAM];
        let mut queries = JoinSet::new();

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(res) = queries.join_next(), if !queries.is_empty() => {
                    if let Err(e) = res {
                        error!(error = %e, "DNS query task failed");
                    }
                    continue;
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "failed to receive DNS query");
                        continue;
                    }
                },
            };

            let query = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            let shaper = self.shaper.clone();

            queries.spawn(async move {
                if shaper.drop_datagram() {
                    debug!(%peer, "DNS query lost");
                    return;
                }

                let Some(reply) = handler.handle(&query).await else { return };

                let delay = shaper.datagram_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                if let Err(e) = socket.send_to(&reply, peer).await {
                    debug!(%peer, error = %e, "failed to send DNS reply");
                }
            });
        }

        queries.shutdown().await;
        debug!("DNS proxy stopped");
    }
}

/// A running DNS proxy. The socket is closed on [`DnsService::shutdown`], on [`Release`] and
/// on drop.
#[derive(Debug)]
pub struct DnsService {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl DnsService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops serving and waits until the socket is closed.
    pub async fn shutdown(mut self) -> Result<(), DnsError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }

        info!(local_addr = %self.local_addr, "DNS proxy closed");
        Ok(())
    }
}

impl Drop for DnsService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Release for DnsService {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move { self.shutdown().await.map_err(|e| ReleaseError::new("dns", e)) })
    }
}
