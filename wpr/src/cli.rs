use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, ValueEnum};

/// Record web traffic into an archive, or replay an archive under emulated network conditions.
///
/// Browsers under test are pointed at this host's DNS and HTTP(S) proxies. In record mode every
/// request is fetched from its origin and stored; in replay mode it is answered from the archive
/// only.
#[derive(Debug, Parser)]
#[command(name = "wpr", version, about)]
pub(crate) struct Args {
    /// The archive to replay, or to write in record mode.
    pub(crate) archive: PathBuf,

    /// Record a new archive instead of replaying one.
    #[arg(short, long)]
    pub(crate) record: bool,

    /// Serve the multiplexed protocol instead of HTTP/1.1.
    #[arg(long)]
    pub(crate) mux: bool,

    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub(crate) log_level: LogLevel,

    /// Also write logs to this file.
    #[arg(short = 'f', long)]
    pub(crate) log_file: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(short, long, value_name = "SECS")]
    pub(crate) time_limit: Option<u64>,

    /// Upload bandwidth, e.g. `384Kbit/s` or `1MByte/s`. 0 is unlimited.
    #[arg(short, long, default_value = "0")]
    pub(crate) up: String,

    /// Download bandwidth, e.g. `1500Kbit/s`. 0 is unlimited.
    #[arg(short, long, default_value = "0")]
    pub(crate) down: String,

    /// Round-trip propagation delay in milliseconds.
    #[arg(short = 'm', long, default_value_t = 0)]
    pub(crate) delay_ms: u64,

    /// Probability in [0, 1] that a unit of traffic is lost.
    #[arg(short, long, default_value_t = 0.0)]
    pub(crate) packet_loss_rate: f64,

    /// Share one bandwidth budget per direction across all connections.
    #[arg(long)]
    pub(crate) aggregate: bool,

    /// Do not inject the determinism script into HTML responses.
    #[arg(short, long = "no-deterministic-script")]
    pub(crate) no_deterministic_script: bool,

    /// Send private names to the proxy too, instead of the real nameserver.
    #[arg(short = 'P', long = "no-dns-private-passthrough")]
    pub(crate) no_dns_private_passthrough: bool,

    /// Run neither the DNS proxy nor change the host's nameserver.
    #[arg(short = 'x', long = "no-dns-forwarding")]
    pub(crate) no_dns_forwarding: bool,

    /// Address the proxies listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: IpAddr,

    /// HTTP port.
    #[arg(short = 'o', long, default_value_t = 80)]
    pub(crate) port: u16,

    /// HTTPS port. 0 disables HTTPS.
    #[arg(long, default_value_t = 443)]
    pub(crate) ssl_port: u16,

    #[arg(long, default_value_t = 53)]
    pub(crate) dns_port: u16,

    /// Port clients connect to, redirected to the HTTP port. Defaults to the HTTP port.
    #[arg(long)]
    pub(crate) shaping_port: Option<u16>,

    /// Reproduce the recorded server response times in replay.
    #[arg(long)]
    pub(crate) server_delay: bool,

    /// Write the generated certificate authority to this file, in PEM format.
    #[arg(long, value_name = "PATH")]
    pub(crate) ca_cert: Option<PathBuf>,

    /// Stop recording with an error once the archive holds this many bytes.
    #[arg(long, value_name = "BYTES", requires = "record")]
    pub(crate) max_archive_bytes: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
