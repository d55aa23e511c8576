use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use wpr_shaper::{Bandwidth, ShaperConfig, TrafficShaper};

const PAYLOAD: usize = 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD).map(|i| (i % 251) as u8).collect()
}

/// Writes `payload()` through a shaped server side in `chunk`-sized writes and returns what the
/// client received along with the elapsed time.
async fn transfer_down(shaper: &TrafficShaper, chunk: usize) -> (Vec<u8>, Duration) {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut shaped = shaper.wrap(server);

    let start = Instant::now();
    let writer = tokio::spawn(async move {
        for part in payload().chunks(chunk) {
            shaped.write_all(part).await.unwrap();
        }
        shaped.shutdown().await.unwrap();
        shaped
    });

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    let elapsed = start.elapsed();

    writer.await.unwrap();
    (received, elapsed)
}

#[tokio::test(start_paused = true)]
async fn downlink_cap_bounds_transfer_time_for_any_chunking() {
    let _ = tracing_subscriber::fmt::try_init();

    let shaper =
        TrafficShaper::new(ShaperConfig::default().down(Bandwidth::from_bytes_per_sec(128)))
            .unwrap();

    for chunk in [1, 7, 100, 1024] {
        let (received, elapsed) = transfer_down(&shaper, chunk).await;

        assert_eq!(received, payload(), "chunk size {chunk}");
        assert!(elapsed >= Duration::from_secs(8), "chunk size {chunk}: {elapsed:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn uplink_cap_bounds_transfer_time() {
    let shaper =
        TrafficShaper::new(ShaperConfig::default().up(Bandwidth::from_bytes_per_sec(128)))
            .unwrap();

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut shaped = shaper.wrap(server);

    client.write_all(&payload()).await.unwrap();
    client.shutdown().await.unwrap();

    let start = Instant::now();
    let mut received = Vec::new();
    shaped.read_to_end(&mut received).await.unwrap();

    assert_eq!(received, payload());
    assert!(start.elapsed() >= Duration::from_secs(8));
    assert_eq!(shaped.stats().up_bytes(), PAYLOAD);
}

#[tokio::test(start_paused = true)]
async fn full_loss_delivers_nothing() {
    let shaper = TrafficShaper::new(ShaperConfig::default().packet_loss(1.0)).unwrap();

    let (received, _) = transfer_down(&shaper, 100).await;
    assert!(received.is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_loss_delivers_everything_after_the_one_way_delay() {
    let shaper = TrafficShaper::new(
        ShaperConfig::default().delay(Duration::from_millis(200)).packet_loss(0.0),
    )
    .unwrap();

    let (received, elapsed) = transfer_down(&shaper, 10).await;

    assert_eq!(received, payload());
    assert!(elapsed >= Duration::from_millis(100));
    // The delay is paid once per unit, not accumulated across units.
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn aggregate_budget_is_shared_between_connections() {
    let shaper = TrafficShaper::new(
        ShaperConfig::default().down(Bandwidth::from_bytes_per_sec(128)).aggregate(true),
    )
    .unwrap();

    let start = Instant::now();
    let a = tokio::spawn({
        let shaper = shaper.clone();
        async move { transfer_down(&shaper, 64).await }
    });
    let b = tokio::spawn({
        let shaper = shaper.clone();
        async move { transfer_down(&shaper, 64).await }
    });

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a.0, payload());
    assert_eq!(b.0, payload());
    // 2048 bytes at 128 B/s.
    assert!(start.elapsed() >= Duration::from_secs(16));
}

#[tokio::test]
async fn disabled_shaper_is_transparent() {
    let shaper = TrafficShaper::disabled();
    let (received, _) = transfer_down(&shaper, 33).await;
    assert_eq!(received, payload());
}

#[tokio::test(start_paused = true)]
async fn split_writer_flushes_while_reader_is_busy() {
    let _ = tracing_subscriber::fmt::try_init();

    let shaper =
        TrafficShaper::new(ShaperConfig::default().delay(Duration::from_millis(400))).unwrap();

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (mut reader, mut writer) = tokio::io::split(shaper.wrap(server));

    let flushed = tokio::spawn(async move {
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();
    });

    let read = tokio::spawn(async move {
        let mut buf = [0; 4];
        reader.read_exact(&mut buf).await.unwrap();
        buf
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"ping").await.unwrap();

    let mut hello = [0; 5];
    client.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"hello");

    tokio::time::timeout(Duration::from_secs(3), flushed).await.unwrap().unwrap();
    assert_eq!(&read.await.unwrap(), b"ping");
}
