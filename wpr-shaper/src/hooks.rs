//! Host-level traffic interception.
//!
//! Browsers under test connect to the standard ports. These hooks redirect those ports to the
//! ports the proxy actually listens on, so that client traffic flows through the shaped proxy
//! connections. Rules are tagged so they can be removed exactly.
//!
//! ## Backends
//! - Linux: `iptables -t nat` `REDIRECT` rules in `OUTPUT` (local clients) and `PREROUTING`
//!   (remote clients), marked with a comment.
//! - MacOS: `rdr` rules loaded into a dedicated `pfctl` anchor.
//! - None: the proxy already listens on the shaped ports.

use std::process::Command;

use tracing::{error, info, warn};
use wpr_common::{
    command::{self, Runner},
    scope::{Release, ReleaseError, ReleaseFuture},
};

use crate::HookError;

/// The comment attached to every `iptables` rule.
pub const RULE_COMMENT: &str = "wpr-shaper";
/// The `pfctl` anchor holding the rules.
pub const PF_ANCHOR: &str = "com.apple/wpr";

/// Redirect a port to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub protocol: Transport,
    /// The port clients connect to.
    pub from: u16,
    /// The port the proxy listens on.
    pub to: u16,
}

impl Redirect {
    pub const fn tcp(from: u16, to: u16) -> Self {
        Self { protocol: Transport::Tcp, from, to }
    }

    pub const fn udp(from: u16, to: u16) -> Self {
        Self { protocol: Transport::Udp, from, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// The `iptables` NAT backend.
#[derive(Debug, Clone)]
pub struct Iptables {
    redirects: Vec<Redirect>,
}

impl Iptables {
    pub fn new(redirects: Vec<Redirect>) -> Self {
        Self { redirects }
    }

    fn rule(&self, action: &str, chain: &str, redirect: &Redirect) -> Command {
        let mut cmd = Command::new("iptables");
        cmd.args(["-t", "nat", action, chain])
            .args(["-p", redirect.protocol.as_str()])
            .args(["--dport", &redirect.from.to_string()])
            .args(["-m", "comment", "--comment", RULE_COMMENT])
            .args(["-j", "REDIRECT", "--to-ports", &redirect.to.to_string()]);

        cmd
    }

    /// Commands adding the rules, in order.
    pub fn install_commands(&self) -> Vec<Command> {
        self.redirects
            .iter()
            .flat_map(|r| [self.rule("-A", "OUTPUT", r), self.rule("-A", "PREROUTING", r)])
            .collect()
    }

    /// Commands deleting the rules, in reverse order.
    pub fn remove_commands(&self) -> Vec<Command> {
        self.redirects
            .iter()
            .rev()
            .flat_map(|r| [self.rule("-D", "PREROUTING", r), self.rule("-D", "OUTPUT", r)])
            .collect()
    }
}

/// The `pfctl` anchor backend.
#[derive(Debug, Clone)]
pub struct PfAnchor {
    anchor: String,
    redirects: Vec<Redirect>,
}

impl PfAnchor {
    pub fn new(redirects: Vec<Redirect>) -> Self {
        Self { anchor: PF_ANCHOR.to_string(), redirects }
    }

    /// The rule set loaded into the anchor.
    pub fn rules(&self) -> String {
        self.redirects
            .iter()
            .map(|r| {
                format!(
                    "rdr pass on lo0 inet proto {} from any to any port {} -> 127.0.0.1 port {}\n",
                    r.protocol.as_str(),
                    r.from,
                    r.to
                )
            })
            .collect()
    }

    /// `pfctl -a <anchor> -f -`, fed with [`PfAnchor::rules`] on stdin.
    pub fn load_command(&self) -> Command {
        let mut cmd = Command::new("pfctl");
        cmd.args(["-a", &self.anchor, "-f", "-"]);
        cmd
    }

    /// `pfctl -a <anchor> -F all`.
    pub fn flush_command(&self) -> Command {
        let mut cmd = Command::new("pfctl");
        cmd.args(["-a", &self.anchor, "-F", "all"]);
        cmd
    }
}

/// The interception backend for this host.
#[derive(Debug, Clone)]
pub enum HostHooks {
    Iptables(Iptables),
    PfAnchor(PfAnchor),
    None,
}

impl HostHooks {
    /// Picks the backend for the current platform. An empty redirect list needs no hooks.
    pub fn for_platform(redirects: Vec<Redirect>) -> Self {
        let redirects: Vec<_> = redirects.into_iter().filter(|r| r.from != r.to).collect();
        if redirects.is_empty() {
            return Self::None;
        }

        if cfg!(target_os = "linux") {
            Self::Iptables(Iptables::new(redirects))
        } else if cfg!(target_os = "macos") {
            Self::PfAnchor(PfAnchor::new(redirects))
        } else {
            warn!("no traffic interception backend for this platform");
            Self::None
        }
    }

    fn install(&self) -> Result<usize, HookError> {
        match self {
            Self::Iptables(iptables) => {
                let commands = iptables.install_commands();
                for (applied, cmd) in commands.into_iter().enumerate() {
                    if let Err(e) = run(cmd) {
                        // Roll back what was added so far, in reverse.
                        let removals = iptables.remove_commands();
                        let skip = removals.len() - applied;
                        for cmd in removals.into_iter().skip(skip) {
                            let _ = run(cmd);
                        }
                        return Err(e);
                    }
                }
                Ok(iptables.redirects.len())
            }
            Self::PfAnchor(pf) => {
                let rules = pf.rules();
                let cmd = pf.load_command();
                let rendered = command::to_string(&cmd);
                Runner::with_stdin(cmd, &rules)
                    .map_err(|source| HookError::Command { command: rendered, source })?;
                Ok(pf.redirects.len())
            }
            Self::None => Ok(0),
        }
    }

    /// Removes every rule, continuing past failures. Returns the first failure.
    fn remove(&self) -> Result<(), HookError> {
        let commands = match self {
            Self::Iptables(iptables) => iptables.remove_commands(),
            Self::PfAnchor(pf) => vec![pf.flush_command()],
            Self::None => return Ok(()),
        };

        let mut first_error = None;
        for cmd in commands {
            if let Err(e) = run(cmd) {
                error!(error = %e, "failed to remove interception rule");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn run(cmd: Command) -> Result<(), HookError> {
    let rendered = command::to_string(&cmd);
    Runner::run(cmd).map(|_| ()).map_err(|source| HookError::Command { command: rendered, source })
}

/// Installed interception rules. Removed on [`Release`] and, failing that, on drop.
#[derive(Debug)]
pub struct InterceptionGuard {
    hooks: HostHooks,
    installed: bool,
}

impl InterceptionGuard {
    /// Installs the hooks. On failure nothing stays installed.
    pub fn install(hooks: HostHooks) -> Result<Self, HookError> {
        let rules = hooks.install()?;
        if rules > 0 {
            info!(rules, ?hooks, "installed traffic interception");
        }

        Ok(Self { hooks, installed: true })
    }

    /// Removes the hooks. Calling it again is a no-op.
    pub fn remove(&mut self) -> Result<(), HookError> {
        if !std::mem::take(&mut self.installed) {
            return Ok(());
        }

        self.hooks.remove()
    }

    pub fn hooks(&self) -> &HostHooks {
        &self.hooks
    }
}

impl Drop for InterceptionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            error!(critical = true, error = %e, "interception rules may still be installed");
        }
    }
}

impl Release for InterceptionGuard {
    fn name(&self) -> &'static str {
        "shaper"
    }

    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move {
            let mut guard = *self;
            tokio::task::spawn_blocking(move || guard.remove())
                .await
                .map_err(|e| ReleaseError::new("shaper", HookError::Join(e)))?
                .map_err(|e| ReleaseError::new("shaper", e))
        })
    }
}
