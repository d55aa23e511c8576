use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use wpr_archive::{
    Archive, ArchiveOptions, ArchiveStore, Exchange, RecordedResponse, Scheme, Signature,
};
use wpr_http::{HttpOptions, HttpServer, HttpService, Protocol, NOT_FOUND_BODY};
use wpr_shaper::{ShaperConfig, TrafficShaper};
use wpr_wire::{Codec, Frame, HeaderBlock, Kind};

use crate::support::{localhost, Loopback, Origin, DATA};

type Client = Framed<TcpStream, Codec>;

#[derive(Debug, Default)]
struct Response {
    head: HeaderBlock,
    body: BytesMut,
    reset: Option<String>,
}

impl Response {
    fn status(&self) -> Option<&str> {
        self.head.get_str(":status")
    }
}

fn head(method: &str, authority: &str, path: &str) -> HeaderBlock {
    HeaderBlock::new()
        .with(":method", method.to_string())
        .with(":scheme", "http")
        .with(":authority", authority.to_string())
        .with(":path", path.to_string())
}

fn options() -> HttpOptions {
    HttpOptions::default().http_addr(localhost()).protocol(Protocol::Mux)
}

async fn connect(service: &HttpService) -> Client {
    Framed::new(TcpStream::connect(service.local_addr()).await.unwrap(), Codec::new())
}

/// Reads frames until `count` streams have ended.
async fn collect(client: &mut Client, count: usize) -> HashMap<u32, Response> {
    let mut responses: HashMap<u32, Response> = HashMap::new();
    let mut ended = 0;

    while ended < count {
        let frame = client.next().await.unwrap().unwrap();
        let end = frame.is_end_stream();
        let response = responses.entry(frame.stream_id()).or_default();

        match frame.kind() {
            Kind::Headers => response.head = HeaderBlock::decode(frame.into_payload()).unwrap(),
            Kind::Data => response.body.extend_from_slice(frame.payload()),
            Kind::Reset => {
                response.reset = Some(String::from_utf8(frame.into_payload().to_vec()).unwrap())
            }
        }

        if end {
            ended += 1;
        }
    }

    responses
}

fn archive() -> Arc<ArchiveStore> {
    let mut archive = Archive::new();
    archive.insert(Exchange::new(
        Signature::builder("GET", Scheme::Http, "mux.test", "/a").build(),
        RecordedResponse::new(200).with_header("content-type", "text/plain").with_chunk("alpha"),
    ));
    archive.insert(Exchange::new(
        Signature::builder("POST", Scheme::Http, "mux.test", "/b")
            .body(Bytes::from_static(b"ping"))
            .build(),
        RecordedResponse::new(201).with_chunk("be").with_chunk("ta"),
    ));

    Arc::new(ArchiveStore::frozen(archive))
}

#[tokio::test]
async fn interleaved_streams() {
    let _ = tracing_subscriber::fmt::try_init();

    let service = HttpServer::new(options(), archive()).bind().await.unwrap();
    let mut client = connect(&service).await;

    // Stream 1 stays open while stream 3 is sent in full.
    client.send(Frame::headers(1, head("POST", "mux.test", "/b").encode(), false)).await.unwrap();
    client.send(Frame::headers(3, head("GET", "mux.test", "/a").encode(), true)).await.unwrap();
    client.send(Frame::data(1, Bytes::from_static(b"pi"), false)).await.unwrap();
    client.send(Frame::data(1, Bytes::from_static(b"ng"), true)).await.unwrap();
    let missing = head("GET", "mux.test", "/missing").encode();
    client.send(Frame::headers(5, missing, true)).await.unwrap();

    let responses = collect(&mut client, 3).await;

    assert_eq!(responses[&1].status(), Some("201"));
    assert_eq!(&responses[&1].body[..], b"beta");
    assert_eq!(responses[&3].status(), Some("200"));
    assert_eq!(responses[&3].head.get_str("content-type"), Some("text/plain"));
    assert_eq!(&responses[&3].body[..], b"alpha");
    assert_eq!(responses[&5].status(), Some("404"));
    assert_eq!(&responses[&5].body[..], NOT_FOUND_BODY.as_bytes());

    assert_eq!(service.stats().hits(), 2);
    assert_eq!(service.stats().misses(), 1);
}

#[tokio::test]
async fn pipelined_streams_over_a_delayed_link() {
    let _ = tracing_subscriber::fmt::try_init();

    let shaper =
        TrafficShaper::new(ShaperConfig::default().delay(Duration::from_millis(200))).unwrap();
    let service = HttpServer::new(options(), archive()).shaper(shaper).bind().await.unwrap();
    let mut client = connect(&service).await;

    // The second request arrives while the first response is still held back by the delay.
    client.send(Frame::headers(1, head("GET", "mux.test", "/a").encode(), true)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.send(Frame::headers(3, head("GET", "mux.test", "/a").encode(), true)).await.unwrap();

    let responses =
        tokio::time::timeout(Duration::from_secs(5), collect(&mut client, 2)).await.unwrap();

    assert_eq!(&responses[&1].body[..], b"alpha");
    assert_eq!(&responses[&3].body[..], b"alpha");

    // The connection keeps answering afterwards.
    client.send(Frame::headers(5, head("GET", "mux.test", "/a").encode(), true)).await.unwrap();
    let responses =
        tokio::time::timeout(Duration::from_secs(5), collect(&mut client, 1)).await.unwrap();
    assert_eq!(responses[&5].status(), Some("200"));
}

#[tokio::test]
async fn invalid_streams_are_reset() {
    let _ = tracing_subscriber::fmt::try_init();

    let service = HttpServer::new(options(), archive()).bind().await.unwrap();
    let mut client = connect(&service).await;

    client.send(Frame::data(7, Bytes::from_static(b"orphan"), true)).await.unwrap();
    client
        .send(Frame::headers(9, HeaderBlock::new().with(":method", "GET").encode(), true))
        .await
        .unwrap();
    client.send(Frame::headers(11, Bytes::from_static(b"\x00"), true)).await.unwrap();

    let responses = collect(&mut client, 3).await;

    assert_eq!(responses[&7].reset.as_deref(), Some("unknown stream"));
    assert_eq!(responses[&9].reset.as_deref(), Some("missing :path"));
    assert_eq!(responses[&11].reset.as_deref(), Some("malformed header block"));

    // The connection is still usable.
    client.send(Frame::headers(13, head("GET", "mux.test", "/a").encode(), true)).await.unwrap();
    let responses = collect(&mut client, 1).await;
    assert_eq!(responses[&13].status(), Some("200"));
}

#[tokio::test]
async fn records_over_mux() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let service = HttpServer::new(options(), Arc::clone(&store))
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();
    let mut client = connect(&service).await;

    let request = head("GET", &origin.host(), "/data.json").encode();
    client.send(Frame::headers(1, request, true)).await.unwrap();
    let responses = collect(&mut client, 1).await;

    assert_eq!(responses[&1].status(), Some("200"));
    assert_eq!(&responses[&1].body[..], DATA);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn garbage_closes_the_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let _ = tracing_subscriber::fmt::try_init();

    let service = HttpServer::new(options(), archive()).bind().await.unwrap();
    let addr: SocketAddr = service.local_addr();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0, 0, 0, 1, 0x7f, 0, 0, 0, 0, 0]).await.unwrap();

    let mut buf = Vec::new();
    assert_eq!(stream.read_to_end(&mut buf).await.unwrap(), 0);
}
