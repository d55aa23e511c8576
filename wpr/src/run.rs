//! Starts the services of one run in order, waits for the run to end and tears them down in
//! reverse order.

use std::{future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::Instant};
use tracing::{error, info, warn};
use wpr_archive::{check_writable, ArchiveError, ArchiveStore};
use wpr_common::scope::ScopeStack;
use wpr_dns::{resolver, DnsHandler, DnsOptions, DnsServer, RealDnsLookup, ResolverOverride};
use wpr_http::{CertificateAuthority, HttpServer};
use wpr_shaper::{
    hooks::{HostHooks, InterceptionGuard, Redirect},
    TrafficShaper,
};

use crate::{config::Config, error::Error};

/// Interval of the time limit checks.
const TICK: Duration = Duration::from_secs(1);
/// The port of the real nameserver.
const DNS_PORT: u16 = 53;

/// Runs until interrupted, until the time limit expires or until recording fails.
pub(crate) async fn run(config: Config) -> Result<(), Error> {
    let store = open_archive(&config)?;
    let mut scope = ScopeStack::new();

    let outcome = match start(&config, &store, &mut scope).await {
        Ok(fatal) => wait(config.time_limit, fatal).await,
        Err(e) => {
            error!(critical = true, error = %e, "startup failed, releasing acquired resources");
            scope.release_all().await;
            return Err(e);
        }
    };

    info!("shutting down");
    let errors = scope.release_all().await;
    for e in &errors {
        error!(critical = true, error = %e, "host state may not be restored");
    }

    if store.is_recording() {
        store.persist(&config.archive)?;
        info!(responses = store.len(), path = %config.archive.display(), "saved archive");
    }

    outcome?;
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Release(errors))
    }
}

fn open_archive(config: &Config) -> Result<Arc<ArchiveStore>, Error> {
    if config.record {
        check_writable(&config.archive)?;
        return Ok(Arc::new(ArchiveStore::recording(config.archive_options.clone())));
    }

    Ok(Arc::new(ArchiveStore::load(&config.archive)?))
}

/// Acquires the DNS proxy, the resolver override, the HTTP proxy and the interception rules, in
/// this order. Every acquired resource is on `scope` when this returns, also on failure.
async fn start(
    config: &Config,
    store: &Arc<ArchiveStore>,
    scope: &mut ScopeStack,
) -> Result<Option<mpsc::Receiver<ArchiveError>>, Error> {
    let shaper =
        TrafficShaper::new(config.shaper.clone()).map_err(crate::config::ConfigError::from)?;
    if shaper.is_enabled() {
        info!(config = ?shaper.config(), "shaping traffic");
    }

    // Read before the override below points the host at ourselves.
    let upstream = resolver::system_nameserver().map_err(Error::acquire("nameserver"))?;
    let lookup = Arc::new(RealDnsLookup::new(SocketAddr::new(upstream, DNS_PORT)));
    let answer_ip = config.answer_ip();

    if config.dns_forwarding {
        let options = DnsOptions::new(answer_ip)
            .private_passthrough(config.dns_private_passthrough)
            .skip_hosts(store.hostnames());
        let handler = DnsHandler::new(options, Arc::clone(&lookup));

        let server = DnsServer::bind(config.dns_addr(), handler, shaper.clone())
            .await
            .map_err(Error::acquire("dns"))?;
        scope.push(server.spawn().map_err(Error::acquire("dns"))?);

        let forwarding = tokio::task::spawn_blocking(move || ResolverOverride::apply(answer_ip))
            .await
            .map_err(Error::acquire("dns-forwarding"))?
            .map_err(Error::acquire("dns-forwarding"))?;
        scope.push(forwarding);
    }

    let ca = CertificateAuthority::generate().map_err(Error::acquire("certificate authority"))?;
    let ca = Arc::new(ca);
    if let Some(path) = &config.ca_cert {
        ca.write_pem(path).map_err(Error::acquire("certificate authority"))?;
        info!(path = %path.display(), "wrote CA certificate");
    }

    let mut server = HttpServer::new(config.http.clone(), Arc::clone(store))
        .shaper(shaper)
        .certificate_authority(ca);
    if store.is_recording() {
        server = server.resolver(lookup);
    }

    let mut service = server.bind().await.map_err(Error::acquire("http"))?;
    let fatal = service.take_fatal();
    scope.push(service);

    let redirect = Redirect::tcp(config.shaping_port, config.http_port());
    let hooks = HostHooks::for_platform(vec![redirect]);
    let guard = tokio::task::spawn_blocking(move || InterceptionGuard::install(hooks))
        .await
        .map_err(Error::acquire("shaper"))?
        .map_err(Error::acquire("shaper"))?;
    scope.push(guard);

    Ok(fatal)
}

async fn wait(
    time_limit: Option<Duration>,
    fatal: Option<mpsc::Receiver<ArchiveError>>,
) -> Result<(), Error> {
    let started = Instant::now();
    let mut tick = tokio::time::interval(TICK);

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let fatal = async move {
        match fatal {
            Some(mut rx) => match rx.recv().await {
                Some(e) => e,
                None => future::pending().await,
            },
            None => future::pending().await,
        }
    };
    tokio::pin!(fatal);

    loop {
        tokio::select! {
            res = &mut interrupt => {
                match res {
                    Ok(()) => info!("interrupted"),
                    Err(e) => warn!(error = %e, "failed to listen for interrupts"),
                }
                return Ok(());
            }
            e = &mut fatal => return Err(Error::Fatal(e)),
            _ = tick.tick() => {
                if time_limit.is_some_and(|limit| started.elapsed() >= limit) {
                    info!(?time_limit, "time limit reached");
                    return Ok(());
                }
            }
        }
    }
}
