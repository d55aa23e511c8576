//! Pointing the host resolver at the DNS proxy.
//!
//! - Linux: the first `nameserver` of `/etc/resolv.conf` is replaced; the original file is
//!   backed up next to it and written back on restore.
//! - MacOS: the `ServerAddresses` of the primary network service are replaced with `scutil`.

use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{error, info};
use wpr_common::{
    command::Runner,
    scope::{Release, ReleaseError, ReleaseFuture},
};

use crate::{lookup::nameserver_from_resolv_conf, DnsError};

pub const RESOLV_CONF: &str = "/etc/resolv.conf";
const BACKUP_SUFFIX: &str = "wpr-backup";
const SCUTIL_DNS_PATTERN: &str = "State:/Network/Service/[^/]+/DNS";

#[derive(Debug)]
enum Backend {
    ResolvConf { path: PathBuf, backup: PathBuf, original: String },
    Scutil { key: String, original: Vec<IpAddr> },
}

/// The nameserver the host used before any override, i.e. the one to ask for real answers.
pub fn system_nameserver() -> Result<IpAddr, DnsError> {
    if cfg!(target_os = "macos") {
        let key = scutil_dns_key()?;
        scutil_addresses(&key)?.first().copied().ok_or(DnsError::Scutil(key))
    } else {
        nameserver_in(RESOLV_CONF)
    }
}

/// Reads the first nameserver of a `resolv.conf` style file.
pub fn nameserver_in(path: impl AsRef<Path>) -> Result<IpAddr, DnsError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    nameserver_from_resolv_conf(&contents).ok_or_else(|| DnsError::NoNameserver(path.to_path_buf()))
}

/// The host resolver configuration, redirected to the DNS proxy until restored.
#[derive(Debug)]
pub struct ResolverOverride {
    backend: Backend,
    nameserver: IpAddr,
    active: bool,
}

impl ResolverOverride {
    /// Makes `nameserver` the primary nameserver of this host.
    pub fn apply(nameserver: IpAddr) -> Result<Self, DnsError> {
        if cfg!(target_os = "macos") {
            Self::apply_scutil(nameserver)
        } else if cfg!(target_os = "linux") {
            Self::apply_resolv_conf(RESOLV_CONF, nameserver)
        } else {
            Err(DnsError::Unsupported)
        }
    }

    /// Makes `nameserver` the first nameserver of the `resolv.conf` at `path`.
    pub fn apply_resolv_conf(
        path: impl Into<PathBuf>,
        nameserver: IpAddr,
    ) -> Result<Self, DnsError> {
        let path = path.into();
        let original = fs::read_to_string(&path)?;

        let mut backup = path.clone().into_os_string();
        backup.push(".");
        backup.push(BACKUP_SUFFIX);
        let backup = PathBuf::from(backup);

        fs::write(&backup, &original)?;
        fs::write(&path, set_primary_nameserver(&original, nameserver))?;

        info!(path = %path.display(), %nameserver, "system resolver now points at the DNS proxy");

        let backend = Backend::ResolvConf { path, backup, original };
        Ok(Self { backend, nameserver, active: true })
    }

    fn apply_scutil(nameserver: IpAddr) -> Result<Self, DnsError> {
        let key = scutil_dns_key()?;
        let original = scutil_addresses(&key)?;
        scutil_set(&key, &[nameserver])?;

        info!(%key, ?original, %nameserver, "system resolver now points at the DNS proxy");

        Ok(Self { backend: Backend::Scutil { key, original }, nameserver, active: true })
    }

    pub fn nameserver(&self) -> IpAddr {
        self.nameserver
    }

    /// Restores the original configuration. Calling it again is a no-op.
    pub fn restore(&mut self) -> Result<(), DnsError> {
        if !std::mem::take(&mut self.active) {
            return Ok(());
        }

        match &self.backend {
            Backend::ResolvConf { path, backup, original } => {
                fs::write(path, original)?;
                // The backup only matters while the override is active.
                let _ = fs::remove_file(backup);
            }
            Backend::Scutil { key, original } => scutil_set(key, original)?,
        }

        info!("system resolver configuration restored");
        Ok(())
    }
}

impl Drop for ResolverOverride {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!(
                critical = true,
                error = %e,
                "system resolver configuration may not be restored"
            );
        }
    }
}

impl Release for ResolverOverride {
    fn name(&self) -> &'static str {
        "dns-forwarding"
    }

    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move {
            let mut guard = *self;
            tokio::task::spawn_blocking(move || guard.restore())
                .await
                .map_err(|e| ReleaseError::new("dns-forwarding", DnsError::Join(e)))?
                .map_err(|e| ReleaseError::new("dns-forwarding", e))
        })
    }
}

/// Replaces the first `nameserver` line, or prepends one if there is none.
fn set_primary_nameserver(contents: &str, nameserver: IpAddr) -> String {
    let line = format!("nameserver {nameserver}");
    let mut replaced = false;

    let mut lines: Vec<&str> = contents
        .lines()
        .map(|l| {
            if !replaced && l.split_whitespace().next() == Some("nameserver") {
                replaced = true;
                line.as_str()
            } else {
                l
            }
        })
        .collect();

    if !replaced {
        lines.insert(0, &line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn scutil(input: &str) -> Result<String, DnsError> {
    Ok(Runner::with_stdin(Command::new("scutil"), input)?.stdout)
}

fn scutil_dns_key() -> Result<String, DnsError> {
    let output = scutil(&format!("list {SCUTIL_DNS_PATTERN}\n"))?;
    parse_scutil_key(&output).ok_or(DnsError::Scutil(output))
}

fn scutil_addresses(key: &str) -> Result<Vec<IpAddr>, DnsError> {
    Ok(parse_scutil_addresses(&scutil(&format!("show {key}\n"))?))
}

fn scutil_set(key: &str, addresses: &[IpAddr]) -> Result<(), DnsError> {
    let addresses: Vec<String> = addresses.iter().map(ToString::to_string).collect();
    scutil(&format!("d.init\nd.add ServerAddresses * {}\nset {key}\n", addresses.join(" ")))?;
    Ok(())
}

/// `  subKey [0] = State:/Network/Service/<id>/DNS` -> the key.
fn parse_scutil_key(output: &str) -> Option<String> {
    output.lines().find_map(|l| l.split_whitespace().last()).map(str::to_string)
}

/// Extracts the `ServerAddresses` array of `scutil show` output.
fn parse_scutil_addresses(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .skip_while(|l| !l.contains("ServerAddresses"))
        .skip(1)
        .take_while(|l| l.trim() != "}")
        .filter_map(|l| l.split(" : ").nth(1)?.trim().parse().ok())
        .collect()
}
