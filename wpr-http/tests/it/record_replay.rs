use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hyper::StatusCode;
use tokio::net::TcpListener;
use wpr_archive::{
    inject::DETERMINISTIC_SCRIPT, Archive, ArchiveError, ArchiveOptions, ArchiveStore, Exchange,
    RecordedResponse, Scheme, Signature, Timing,
};
use wpr_http::{HttpOptions, HttpServer, NOT_FOUND_BODY};

use crate::support::{get, localhost, post, Loopback, Origin, DATA, PAGE};

fn options() -> HttpOptions {
    HttpOptions::default().http_addr(localhost())
}

#[tokio::test]
async fn record_then_replay() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let host = origin.host();

    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let service = HttpServer::new(options(), Arc::clone(&store))
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();

    let (status, headers, data) = get(service.local_addr(), &host, "/data.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data, Bytes::from_static(DATA));
    assert_eq!(headers["content-type"], "application/json");

    let (status, headers, page) = get(service.local_addr(), &host, "/page").await;
    assert_eq!(status, StatusCode::OK);
    assert!(page.windows(DETERMINISTIC_SCRIPT.len()).any(|w| w == DETERMINISTIC_SCRIPT.as_bytes()));
    assert_eq!(headers["content-length"], page.len().to_string().as_str());

    assert_eq!(service.stats().recorded(), 2);
    service.shutdown().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.wpr");
    store.persist(&path).unwrap();

    // The archive keeps the page as the origin sent it.
    let replay = Arc::new(ArchiveStore::load(&path).unwrap());
    let signature = Signature::builder("GET", Scheme::Http, &host, "/page").build();
    assert_eq!(replay.lookup(&signature).unwrap().response.body(), Bytes::from_static(PAGE));

    let fetched = origin.connections();
    let service = HttpServer::new(options(), replay).bind().await.unwrap();

    let (status, headers, replayed) = get(service.local_addr(), &host, "/data.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed, data);
    assert_eq!(headers["content-type"], "application/json");

    let (_, _, replayed) = get(service.local_addr(), &host, "/page").await;
    assert_eq!(replayed, page);

    assert_eq!(origin.connections(), fetched);
}

#[tokio::test]
async fn misses_never_reach_the_network() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let service = HttpServer::new(options(), Arc::new(ArchiveStore::frozen(Archive::new())))
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();

    for path in ["/page", "/data.json", "/missing?x=1"] {
        let (status, _, body) = get(service.local_addr(), &origin.host(), path).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, Bytes::from_static(NOT_FOUND_BODY.as_bytes()));
    }

    assert_eq!(origin.connections(), 0);
    assert_eq!(service.stats().misses(), 3);
}

#[tokio::test]
async fn generated_status_codes() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = Arc::new(ArchiveStore::frozen(Archive::new()));
    let service = HttpServer::new(options(), store).bind().await.unwrap();

    let addr = service.local_addr();
    let (status, _, body) = get(addr, "any.test", "/web-page-replay-generate-204").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let (status, _, _) = get(addr, "any.test", "/web-page-replay-generate-503").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn recorded_requests_are_not_fetched_again() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let service = HttpServer::new(options(), store)
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();

    let (_, _, first) = get(service.local_addr(), &origin.host(), "/data.json").await;
    let (_, _, second) = get(service.local_addr(), &origin.host(), "/data.json").await;

    assert_eq!(first, second);
    assert_eq!(origin.connections(), 1);
    assert_eq!(service.stats().hits(), 1);
}

#[tokio::test]
async fn request_bodies_are_part_of_the_key() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let service = HttpServer::new(options(), Arc::clone(&store))
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();

    let (status, _, body) = post(service.local_addr(), &origin.host(), "/echo", b"first").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"first"));
    service.shutdown().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.wpr");
    store.persist(&path).unwrap();

    let store = Arc::new(ArchiveStore::load(&path).unwrap());
    let service = HttpServer::new(options(), store).bind().await.unwrap();

    let (status, _, body) = post(service.local_addr(), &origin.host(), "/echo", b"first").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"first"));

    let (status, _, _) = post(service.local_addr(), &origin.host(), "/echo", b"second").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let _ = tracing_subscriber::fmt::try_init();

    let closed = TcpListener::bind(localhost()).await.unwrap().local_addr().unwrap();
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let service = HttpServer::new(options(), Arc::clone(&store))
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();

    let host = format!("origin.test:{}", closed.port());
    let (status, _, _) = get(service.local_addr(), &host, "/page").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(service.stats().origin_failures(), 1);
    assert!(store.is_empty());

    // The run goes on.
    let (status, _, _) = get(service.local_addr(), &host, "/web-page-replay-generate-200").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn failed_recording_is_fatal() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = Origin::start().await;
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default().max_bytes(1)));
    let mut service = HttpServer::new(options(), store)
        .resolver(Arc::new(Loopback))
        .bind()
        .await
        .unwrap();
    let mut fatal = service.take_fatal().unwrap();

    let (status, _, _) = get(service.local_addr(), &origin.host(), "/data.json").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let error = tokio::time::timeout(Duration::from_secs(1), fatal.recv()).await.unwrap().unwrap();
    assert!(matches!(error, ArchiveError::CapacityExceeded { limit: 1 }));
}

#[tokio::test]
async fn recording_requires_a_resolver() {
    let store = Arc::new(ArchiveStore::recording(ArchiveOptions::default()));
    let result = HttpServer::new(options(), store).bind().await;

    assert!(matches!(result, Err(wpr_http::HttpError::NoResolver)));
}

#[tokio::test]
async fn replays_recorded_timing() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut response = RecordedResponse::new(200)
        .with_header("content-type", "text/plain")
        .with_chunk("one,")
        .with_chunk("two");
    response.timing = Timing {
        server_delay: Duration::from_millis(200),
        chunk_delays: vec![Duration::from_millis(100)],
    };

    let mut archive = Archive::new();
    archive.insert(Exchange::new(
        Signature::builder("GET", Scheme::Http, "slow.test", "/").build(),
        response,
    ));
    let store = Arc::new(ArchiveStore::frozen(archive));

    let service = HttpServer::new(options().server_delay(true), store).bind().await.unwrap();

    let start = std::time::Instant::now();
    let (status, _, body) = get(service.local_addr(), "slow.test", "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"one,two"));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn shutdown_releases_the_port() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = Arc::new(ArchiveStore::frozen(Archive::new()));
    let service = HttpServer::new(options(), store).bind().await.unwrap();
    let addr = service.local_addr();

    service.shutdown().await.unwrap();

    TcpListener::bind(addr).await.expect("port released");
}
