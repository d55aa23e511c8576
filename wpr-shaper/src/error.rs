use thiserror::Error;
use wpr_common::command;

/// Invalid shaping parameters. Detected before any resource is acquired.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid bandwidth {0:?}: expected <n>[K|M](bit/s|Byte/s)")]
    Bandwidth(String),
    #[error("invalid packet loss rate {0}: expected a value in [0, 1]")]
    PacketLoss(f64),
}

/// Failure to install or remove host interception rules.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to run `{command}`: {source}")]
    Command { command: String, source: command::Error },
    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
