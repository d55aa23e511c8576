//! `wpr`: records web page loads into an archive and replays them.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

mod cli;
mod config;
mod error;
mod logging;
mod run;

use cli::Args;
use config::Config;
use error::Error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            let e = Error::from(e);
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let _guard = match logging::init(config.log_level, config.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            let e = Error::acquire("log file")(e);
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match run::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(critical = true, error = %e, "exiting");
            ExitCode::from(e.exit_code())
        }
    }
}
