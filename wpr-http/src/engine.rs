use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use wpr_archive::{ArchiveError, ArchiveStore, Exchange, Injector, RecordedResponse, Signature};

use crate::{origin::OriginClient, request::ProxyRequest, stats::HttpStats};

/// Body of the response to requests without a recording.
pub const NOT_FOUND_BODY: &str = "no recording available";

/// A response ready to be written to a client.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response: RecordedResponse,
    /// Whether the recorded server and chunk delays are reproduced.
    pub paced: bool,
}

impl Reply {
    fn immediate(response: RecordedResponse) -> Self {
        Self { response, paced: false }
    }

    /// A plain-text response generated by the proxy itself.
    pub(crate) fn text(status: u16, body: &'static str) -> Self {
        let response = RecordedResponse::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(Bytes::from_static(body.as_bytes()));

        Self::immediate(response)
    }
}

/// Answers requests from the archive, fetching and recording them in record mode. Shared by the
/// connections of both front-end protocols.
#[derive(Debug)]
pub(crate) struct Engine {
    store: Arc<ArchiveStore>,
    /// Present in record mode only.
    origin: Option<OriginClient>,
    injector: Option<Injector>,
    /// Reproduce recorded timing in replay.
    server_delay: bool,
    fatal: mpsc::Sender<ArchiveError>,
    stats: Arc<HttpStats>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<ArchiveStore>,
        origin: Option<OriginClient>,
        injector: Option<Injector>,
        server_delay: bool,
        fatal: mpsc::Sender<ArchiveError>,
        stats: Arc<HttpStats>,
    ) -> Self {
        Self { store, origin, injector, server_delay, fatal, stats }
    }

    pub(crate) fn stats(&self) -> &HttpStats {
        &self.stats
    }

    pub(crate) async fn respond(&self, request: ProxyRequest) -> Reply {
        self.stats.increment_requests();

        if let Some(status) = request.generated_status() {
            debug!(status, "generated response");
            return Reply::immediate(RecordedResponse::new(status).with_body(Bytes::new()));
        }

        let signature = request.signature();

        if let Some(exchange) = self.store.lookup(&signature) {
            self.stats.increment_hits();
            debug!(%signature, "serving from archive");
            let paced = self.server_delay && self.origin.is_none();
            return self.serve(&exchange.response, paced);
        }

        match &self.origin {
            Some(origin) => self.record(origin, request, signature).await,
            None => self.miss(&signature),
        }
    }

    async fn record(
        &self,
        origin: &OriginClient,
        request: ProxyRequest,
        signature: Signature,
    ) -> Reply {
        let response = match origin.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.increment_origin_failures();
                warn!(%signature, error = %e, "origin fetch failed");
                return Reply::text(502, "origin unreachable");
            }
        };

        match self.store.record(Exchange::new(signature, response)) {
            Ok(recorded) => {
                self.stats.increment_recorded();
                self.serve(&recorded.exchange().response, false)
            }
            Err(e) => {
                error!(critical = true, error = %e, "failed to record exchange, stopping the run");
                // Only the first failure needs to reach the orchestrator.
                let _ = self.fatal.try_send(e);
                Reply::text(500, "recording failed")
            }
        }
    }

    fn miss(&self, signature: &Signature) -> Reply {
        self.stats.increment_misses();

        match self.store.closest(signature) {
            Some(closest) => warn!(
                request = %signature,
                %closest,
                diff = %describe_difference(signature, &closest),
                "no recording available"
            ),
            None => warn!(request = %signature, "no recording available"),
        }

        Reply::text(404, NOT_FOUND_BODY)
    }

    fn serve(&self, response: &RecordedResponse, paced: bool) -> Reply {
        let response = match &self.injector {
            Some(injector) => injector.apply(response).into_owned(),
            None => response.clone(),
        };

        Reply { response, paced }
    }
}

/// Lists the signature components in which `closest` differs from `request`.
pub(crate) fn describe_difference(request: &Signature, closest: &Signature) -> String {
    let mut diff = Vec::new();

    if request.method() != closest.method() {
        diff.push(format!("method {} != {}", request.method(), closest.method()));
    }
    if request.scheme() != closest.scheme() {
        diff.push(format!("scheme {} != {}", request.scheme().as_str(), closest.scheme().as_str()));
    }
    if request.path() != closest.path() {
        diff.push(format!("path {} != {}", request.path(), closest.path()));
    }
    if request.query() != closest.query() {
        diff.push(format!(
            "query {:?} != {:?}",
            request.query().unwrap_or_default(),
            closest.query().unwrap_or_default()
        ));
    }
    for (name, value) in request.headers() {
        match closest.headers().get(name) {
            Some(other) if other == value => {}
            other => diff.push(format!("{name} {value:?} != {other:?}")),
        }
    }
    for name in closest.headers().keys().filter(|n| !request.headers().contains_key(*n)) {
        diff.push(format!("{name} missing"));
    }
    if request.body() != closest.body() {
        diff.push(format!("body {} bytes != {} bytes", request.body().len(), closest.body().len()));
    }

    diff.join(", ")
}
