use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;
use wpr_archive::ArchiveOptions;
use wpr_http::{HttpOptions, Protocol};
use wpr_shaper::{Bandwidth, ShaperConfig};

use crate::cli::{Args, LogLevel};

#[derive(Debug, Error, PartialEq)]
pub(crate) enum ConfigError {
    #[error(transparent)]
    Shaper(#[from] wpr_shaper::ConfigError),
    #[error("option {0} cannot be used with --record")]
    Record(&'static str),
}

/// A validated run configuration.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) archive: PathBuf,
    pub(crate) record: bool,
    /// Limits of a recording archive.
    pub(crate) archive_options: ArchiveOptions,
    pub(crate) log_level: LogLevel,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) shaper: ShaperConfig,
    pub(crate) http: HttpOptions,
    pub(crate) host: IpAddr,
    pub(crate) dns_port: u16,
    /// The port clients connect to for HTTP.
    pub(crate) shaping_port: u16,
    pub(crate) dns_forwarding: bool,
    pub(crate) dns_private_passthrough: bool,
    pub(crate) ca_cert: Option<PathBuf>,
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.record {
            let conflicts = [
                ("--up", args.up != "0"),
                ("--down", args.down != "0"),
                ("--delay-ms", args.delay_ms != 0),
                ("--packet-loss-rate", args.packet_loss_rate != 0.0),
                ("--aggregate", args.aggregate),
                ("--server-delay", args.server_delay),
            ];

            if let Some((flag, _)) = conflicts.iter().find(|(_, set)| *set) {
                return Err(ConfigError::Record(*flag));
            }
        }

        let shaper = ShaperConfig::default()
            .up(args.up.parse::<Bandwidth>()?)
            .down(args.down.parse::<Bandwidth>()?)
            .delay(Duration::from_millis(args.delay_ms))
            .packet_loss(args.packet_loss_rate)
            .aggregate(args.aggregate);
        shaper.validate()?;

        let mut http = HttpOptions::default()
            .http_addr(SocketAddr::new(args.host, args.port))
            .protocol(if args.mux { Protocol::Mux } else { Protocol::Http1 })
            .inject_scripts(!args.no_deterministic_script)
            .server_delay(args.server_delay);
        if args.ssl_port != 0 {
            http = http.https_addr(SocketAddr::new(args.host, args.ssl_port));
        }

        let mut archive_options = ArchiveOptions::default();
        if let Some(max_bytes) = args.max_archive_bytes {
            archive_options = archive_options.max_bytes(max_bytes);
        }

        Ok(Self {
            archive: args.archive,
            record: args.record,
            archive_options,
            log_level: args.log_level,
            log_file: args.log_file,
            time_limit: args.time_limit.map(Duration::from_secs),
            shaper,
            http,
            host: args.host,
            dns_port: args.dns_port,
            shaping_port: args.shaping_port.unwrap_or(args.port),
            dns_forwarding: !args.no_dns_forwarding,
            dns_private_passthrough: !args.no_dns_private_passthrough,
            ca_cert: args.ca_cert,
        })
    }
}

impl Config {
    /// The address DNS answers point at. A wildcard listen address is answered with loopback.
    pub(crate) fn answer_ip(&self) -> IpAddr {
        match self.host {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        }
    }

    pub(crate) fn dns_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.dns_port)
    }

    /// The HTTP port the proxy listens on.
    pub(crate) fn http_port(&self) -> u16 {
        self.http.http_addr.port()
    }
}
