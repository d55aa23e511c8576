//! Utilies for [`std::process::Command`].
//!
//! Every change the replay tools make to host state (resolver configuration, packet filter
//! rules) goes through the [`Runner`], so the exact invocation is logged and a failing
//! command surfaces its stderr.

use std::{
    io::{self, Write as _},
    process,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status: {}", .0.stderr.trim())]
    NonZero(Output),
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Runner;

impl Runner {
    /// Runs an already built command, capturing its output.
    pub fn run(mut cmd: process::Command) -> Result<Output> {
        cmd.stderr(process::Stdio::piped()).stdout(process::Stdio::piped());

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();
        Self::check(&cmd, output)
    }

    /// Runs a command feeding `input` on its standard input. Used for tools such as `pfctl -f -`
    /// and `scutil` that read their instructions from stdin.
    pub fn with_stdin(mut cmd: process::Command, input: &str) -> Result<Output> {
        cmd.stdin(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .stdout(process::Stdio::piped());

        tracing::debug!(?cmd, input, "running command with stdin");

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }

        let output: Output = child.wait_with_output()?.into();
        Self::check(&cmd, output)
    }

    fn check(cmd: &process::Command, output: Output) -> Result<Output> {
        if !output.status.success() {
            tracing::debug!(
                ?output.stderr,
                ?output.status,
                ?cmd,
                "command returned non-zero status"
            );
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}

/// Renders a command the way it would be typed in a shell. Used in logs and tests.
pub fn to_string(cmd: &process::Command) -> String {
    let mut cmd_str = format!("{}", cmd.get_program().to_string_lossy());
    for arg in cmd.get_args() {
        cmd_str.push(' ');
        cmd_str.push_str(&arg.to_string_lossy());
    }

    cmd_str
}
