use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header::{HeaderName, HeaderValue, HOST},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wpr_archive::Scheme;

use crate::{
    engine::{Engine, Reply},
    request::{is_hop_by_hop, ProxyRequest},
};

type Body = UnsyncBoxBody<Bytes, Infallible>;

/// Serves HTTP/1.1 on one client connection until it closes. Once `shutdown` fires, the
/// in-flight request is completed and the connection is closed.
pub(crate) async fn serve<Io>(
    io: Io,
    scheme: Scheme,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
) where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let engine = Arc::clone(&engine);
        async move { Ok::<_, Infallible>(handle(request, scheme, &engine).await) }
    });

    let conn = http1::Builder::new().keep_alive(true).serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(error = %e, "HTTP connection error");
                }
                break;
            }
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle(request: Request<Incoming>, scheme: Scheme, engine: &Engine) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return into_response(Reply::text(400, "malformed request")).await;
        }
    };

    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| parts.headers.get(HOST)?.to_str().ok().map(str::to_string));

    let Some(authority) = authority else {
        debug!(uri = %parts.uri, "request without host");
        return into_response(Reply::text(400, "missing host")).await;
    };

    let request = ProxyRequest {
        method: parts.method.as_str().to_string(),
        scheme,
        authority,
        path_and_query: parts.uri.path_and_query().map_or("/", |pq| pq.as_str()).to_string(),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (name.as_str().to_string(), Bytes::copy_from_slice(value.as_bytes()))
            })
            .collect(),
        body,
    };

    into_response(engine.respond(request).await).await
}

/// Writes the reply head after the recorded server delay when paced. Paced bodies are streamed
/// with the recorded delays between chunks.
async fn into_response(reply: Reply) -> Response<Body> {
    let Reply { response, paced } = reply;

    if paced && !response.timing.server_delay.is_zero() {
        tokio::time::sleep(response.timing.server_delay).await;
    }

    let mut builder = Response::builder().status(response.status);
    for (name, value) in response.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        let parsed_name = HeaderName::from_bytes(name.as_bytes());
        match (parsed_name, HeaderValue::from_maybe_shared(value.clone())) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(name, "skipping invalid recorded header"),
        }
    }

    let body = if paced && !response.timing.chunk_delays.is_empty() {
        let delays = response.timing.chunk_delays;
        let chunks = response.chunks.into_iter().enumerate();
        let chunks = futures::stream::iter(chunks).then(move |(i, chunk)| {
            let delay = i.checked_sub(1).and_then(|i| delays.get(i)).copied();
            async move {
                if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, Infallible>(Frame::data(chunk))
            }
        });
        StreamBody::new(chunks).boxed_unsync()
    } else {
        Full::new(response.body()).boxed_unsync()
    };

    builder.body(body).unwrap_or_else(|e| {
        debug!(error = %e, "invalid recorded response");
        let body = Full::new(Bytes::from_static(b"invalid recorded response"));
        let mut fallback = Response::new(body.boxed_unsync());
        *fallback.status_mut() = StatusCode::BAD_GATEWAY;
        fallback
    })
}
