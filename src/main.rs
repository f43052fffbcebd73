mod cli;
mod cmd;
mod command;
mod config;
mod error;
mod git;
mod job;
mod logger;
mod sandbox;
mod server;
mod snapshot;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;
    logger::init(config.log_level(), config.log_file.as_deref())?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "maxima-pool start");

    match cli::run(cli, &config) {
        Ok(result) => {
            info!("maxima-pool finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "maxima-pool failed");
            Err(err)
        }
    }
}
