//! The multiplexed front-end.
//!
//! Many requests share one connection. A request is a `HEADERS` frame carrying the pseudo fields
//! `:method`, `:scheme`, `:authority` and `:path` followed by optional `DATA` frames; the last
//! frame of the request carries `END_STREAM`. Responses are written on the request's stream id
//! as a `HEADERS` frame with `:status` and `DATA` frames. Invalid requests are answered with
//! `RESET`, an invalid frame closes the connection.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};
use wpr_archive::Scheme;
use wpr_wire::{Codec, Frame, HeaderBlock, Kind, MAX_FRAME_SIZE};

use crate::{
    engine::{Engine, Reply},
    request::{is_hop_by_hop, ProxyRequest},
};

/// Response frames waiting to be written.
const WRITE_QUEUE: usize = 64;

/// A request whose frames are still arriving.
struct Pending {
    head: HeaderBlock,
    body: BytesMut,
}

/// Serves the mux protocol on one client connection until it closes. Once `shutdown` fires, no
/// new frames are read; requests already received are answered before the connection closes.
pub(crate) async fn serve<Io>(
    io: Io,
    scheme: Scheme,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
) where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(io, Codec::new()).split();
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITE_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "failed to write mux frame");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut pending: FxHashMap<u32, Pending> = FxHashMap::default();
    let mut streams = JoinSet::new();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = streams.join_next(), if !streams.is_empty() => continue,
            frame = frames.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "invalid mux frame, closing connection");
                break;
            }
            None => break,
        };

        let id = frame.stream_id();
        trace!(id, kind = ?frame.kind(), len = frame.payload().len(), "mux frame");

        let complete = match frame.kind() {
            Kind::Headers if pending.contains_key(&id) => Err("stream already open"),
            Kind::Headers => match HeaderBlock::decode(frame.payload().clone()) {
                Ok(head) if frame.is_end_stream() => Ok(Some((head, Bytes::new()))),
                Ok(head) => {
                    pending.insert(id, Pending { head, body: BytesMut::new() });
                    Ok(None)
                }
                Err(_) => Err("malformed header block"),
            },
            Kind::Data => match pending.get_mut(&id) {
                None => Err("unknown stream"),
                Some(request) => {
                    request.body.extend_from_slice(frame.payload());
                    if frame.is_end_stream() {
                        Ok(pending.remove(&id).map(|p| (p.head, p.body.freeze())))
                    } else {
                        Ok(None)
                    }
                }
            },
            Kind::Reset => {
                pending.remove(&id);
                Ok(None)
            }
        };

        let request = match complete {
            Ok(Some((head, body))) => into_request(&head, body, scheme),
            Ok(None) => continue,
            Err(reason) => Err(reason),
        };

        match request {
            Ok(request) => {
                let engine = Arc::clone(&engine);
                let tx = tx.clone();
                streams.spawn(async move { respond(id, engine.respond(request).await, tx).await });
            }
            Err(reason) => {
                debug!(id, reason, "resetting mux stream");
                pending.remove(&id);
                if tx.send(Frame::reset(id, reason)).await.is_err() {
                    break;
                }
            }
        }
    }

    while streams.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
}

fn into_request(
    head: &HeaderBlock,
    body: Bytes,
    scheme: Scheme,
) -> Result<ProxyRequest, &'static str> {
    let method = head.get_str(":method").ok_or("missing :method")?;
    let path = head.get_str(":path").ok_or("missing :path")?;
    let authority = head
        .get_str(":authority")
        .or_else(|| head.get_str("host"))
        .ok_or("missing :authority")?;

    let scheme = match head.get_str(":scheme") {
        Some("https") => Scheme::Https,
        Some("http") => Scheme::Http,
        Some(_) => return Err("invalid :scheme"),
        None => scheme,
    };

    Ok(ProxyRequest {
        method: method.to_string(),
        scheme,
        authority: authority.to_string(),
        path_and_query: path.to_string(),
        headers: head.regular().map(|(name, value)| (name.to_string(), value.clone())).collect(),
        body,
    })
}

async fn respond(id: u32, reply: Reply, tx: mpsc::Sender<Frame>) {
    let Reply { response, paced } = reply;

    if paced && !response.timing.server_delay.is_zero() {
        tokio::time::sleep(response.timing.server_delay).await;
    }

    let mut head = HeaderBlock::new().with(":status", response.status.to_string());
    for (name, value) in response.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        head.push(name, value.clone());
    }

    if tx.send(Frame::headers(id, head.encode(), response.chunks.is_empty())).await.is_err() {
        return;
    }

    let last = response.chunks.len().saturating_sub(1);
    for (i, mut chunk) in response.chunks.into_iter().enumerate() {
        if paced && i > 0 {
            let delay = response.timing.chunk_delays.get(i - 1).copied().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
        }

        while chunk.len() > MAX_FRAME_SIZE as usize {
            let part = chunk.split_to(MAX_FRAME_SIZE as usize);
            if tx.send(Frame::data(id, part, false)).await.is_err() {
                return;
            }
        }

        if tx.send(Frame::data(id, chunk, i == last)).await.is_err() {
            return;
        }
    }
}
