use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hyper::StatusCode;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, Instant},
};
use wpr_archive::{Archive, ArchiveStore, Exchange, RecordedResponse, Scheme, Signature};
use wpr_http::{HttpOptions, HttpServer};
use wpr_shaper::{Bandwidth, ShaperConfig, TrafficShaper};

use crate::support::{get, localhost};

const BODY_LEN: usize = 1024;

fn body() -> Bytes {
    (0..BODY_LEN).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

fn archive() -> Arc<ArchiveStore> {
    let mut archive = Archive::new();
    archive.insert(Exchange::new(
        Signature::builder("GET", Scheme::Http, "shaped.test", "/blob").build(),
        RecordedResponse::new(200)
            .with_header("content-type", "application/octet-stream")
            .with_chunk(body()),
    ));

    Arc::new(ArchiveStore::frozen(archive))
}

#[tokio::test(start_paused = true)]
async fn downlink_cap_slows_replayed_responses() {
    let _ = tracing_subscriber::fmt::try_init();

    let shaper =
        TrafficShaper::new(ShaperConfig::default().down(Bandwidth::from_bytes_per_sec(128)))
            .unwrap();
    let service = HttpServer::new(HttpOptions::default().http_addr(localhost()), archive())
        .shaper(shaper)
        .bind()
        .await
        .unwrap();

    let start = Instant::now();
    let (status, _, data) = get(service.local_addr(), "shaped.test", "/blob").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(data, body());
    // The head adds to the 1024 body bytes, so 8 seconds is a lower bound.
    assert!(start.elapsed() >= Duration::from_secs(8), "{:?}", start.elapsed());
}

#[tokio::test(start_paused = true)]
async fn full_loss_delivers_no_response_bytes() {
    let _ = tracing_subscriber::fmt::try_init();

    let shaper = TrafficShaper::new(ShaperConfig::default().packet_loss(1.0)).unwrap();
    let service = HttpServer::new(HttpOptions::default().http_addr(localhost()), archive())
        .shaper(shaper)
        .bind()
        .await
        .unwrap();

    let mut stream = TcpStream::connect(service.local_addr()).await.unwrap();
    stream.write_all(b"GET /blob HTTP/1.1\r\nhost: shaped.test\r\n\r\n").await.unwrap();

    let mut buf = [0; 256];
    // Either nothing arrives before the timeout or the connection closes empty.
    if let Ok(read) = timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        assert_eq!(read.unwrap_or(0), 0);
    }

    assert_eq!(service.stats().hits(), 0);
}
