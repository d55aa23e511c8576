use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use hickory_proto::{
    op::{Message, Query},
    rr::{Name, RData, RecordType},
};
use tokio::{net::UdpSocket, time::timeout};
use wpr_dns::{DnsHandler, DnsOptions, DnsServer, DnsService, HostResolver, RealDnsLookup};
use wpr_shaper::{ShaperConfig, TrafficShaper};

const PROXY: &str = "127.0.0.1";

fn dead_lookup() -> Arc<RealDnsLookup> {
    Arc::new(
        RealDnsLookup::new("127.0.0.1:9".parse().unwrap())
            .timeout(Duration::from_millis(50))
            .attempts(1),
    )
}

/// A nameserver that answers every name with `address`, standing in for the real one.
async fn fake_upstream(address: &str) -> DnsService {
    let options = DnsOptions::new(address.parse().unwrap()).private_passthrough(false);
    let handler = DnsHandler::new(options, dead_lookup());
    DnsServer::bind("127.0.0.1:0".parse().unwrap(), handler, TrafficShaper::disabled())
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

async fn proxy(options: DnsOptions, upstream: SocketAddr, shaper: TrafficShaper) -> DnsService {
    let lookup = Arc::new(RealDnsLookup::new(upstream).timeout(Duration::from_millis(500)));
    DnsServer::bind("127.0.0.1:0".parse().unwrap(), DnsHandler::new(options, lookup), shaper)
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

async fn ask(server: SocketAddr, name: &str) -> Option<Message> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut query = Message::new();
    query
        .set_id(7)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    socket.send_to(&query.to_vec().unwrap(), server).await.unwrap();

    let mut buf = vec![0; 4096];
    let (len, _) =
        timeout(Duration::from_millis(1500), socket.recv_from(&mut buf)).await.ok()?.ok()?;
    Some(Message::from_vec(&buf[..len]).unwrap())
}

fn address(reply: &Message) -> Option<IpAddr> {
    reply.answers().iter().find_map(|r| match r.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        _ => None,
    })
}

#[tokio::test]
async fn public_names_resolve_to_proxy() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let options = DnsOptions::new(PROXY.parse().unwrap());
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;

    let reply = ask(proxy.local_addr(), "www.example.com.").await.unwrap();
    assert_eq!(reply.id(), 7);
    assert_eq!(address(&reply), Some(PROXY.parse().unwrap()));
    assert_eq!(reply.answers()[0].ttl(), 60);

    proxy.shutdown().await.unwrap();
    upstream.shutdown().await.unwrap();
}

#[tokio::test]
async fn private_names_pass_through() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("10.0.0.5").await;
    let options = DnsOptions::new(PROXY.parse().unwrap());
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;

    let reply = ask(proxy.local_addr(), "printer.lan.").await.unwrap();
    assert_eq!(address(&reply), Some("10.0.0.5".parse().unwrap()));
}

#[tokio::test]
async fn private_names_resolve_to_proxy_without_passthrough() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("10.0.0.5").await;
    let options = DnsOptions::new(PROXY.parse().unwrap()).private_passthrough(false);
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;

    let reply = ask(proxy.local_addr(), "printer.lan.").await.unwrap();
    assert_eq!(address(&reply), Some(PROXY.parse().unwrap()));
}

#[tokio::test]
async fn archived_hosts_never_pass_through() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("10.0.0.5").await;
    let options = DnsOptions::new(PROXY.parse().unwrap()).skip_hosts(["Intranet.Example.com"]);
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;

    let reply = ask(proxy.local_addr(), "intranet.example.com.").await.unwrap();
    assert_eq!(address(&reply), Some(PROXY.parse().unwrap()));

    let reply = ask(proxy.local_addr(), "printer.lan.").await.unwrap();
    assert_eq!(address(&reply), Some("10.0.0.5".parse().unwrap()));
}

#[tokio::test]
async fn malformed_query_does_not_stop_the_service() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let options = DnsOptions::new(PROXY.parse().unwrap());
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"\x00\x01garbage", proxy.local_addr()).await.unwrap();

    let reply = ask(proxy.local_addr(), "example.com.").await.unwrap();
    assert_eq!(address(&reply), Some(PROXY.parse().unwrap()));
}

#[tokio::test]
async fn lost_queries_get_no_reply() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let shaper = TrafficShaper::new(ShaperConfig::default().packet_loss(1.0).seed(3)).unwrap();
    let proxy = proxy(DnsOptions::new(PROXY.parse().unwrap()), upstream.local_addr(), shaper).await;

    assert!(ask(proxy.local_addr(), "example.com.").await.is_none());
}

#[tokio::test]
async fn replies_are_delayed_by_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let shaper =
        TrafficShaper::new(ShaperConfig::default().delay(Duration::from_millis(300))).unwrap();
    let proxy = proxy(DnsOptions::new(PROXY.parse().unwrap()), upstream.local_addr(), shaper).await;

    let start = std::time::Instant::now();
    ask(proxy.local_addr(), "example.com.").await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn shutdown_releases_the_port() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let options = DnsOptions::new(PROXY.parse().unwrap());
    let proxy = proxy(options, upstream.local_addr(), TrafficShaper::disabled()).await;
    let addr = proxy.local_addr();

    proxy.shutdown().await.unwrap();

    UdpSocket::bind(addr).await.expect("port released");
}

#[tokio::test]
async fn real_lookup_caches_answers() {
    let _ = tracing_subscriber::fmt::try_init();

    let upstream = fake_upstream("93.184.216.34").await;
    let lookup = RealDnsLookup::new(upstream.local_addr());

    let ip: IpAddr = "93.184.216.34".parse().unwrap();
    assert_eq!(lookup.resolve("Example.com").await.unwrap(), ip);
    assert_eq!(lookup.cached("example.com"), Some("93.184.216.34".parse().unwrap()));
}
