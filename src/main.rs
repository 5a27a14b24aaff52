//! tclockd — IEEE 1588 peer-to-peer transparent clock daemon.
//!
//! Forwards PTP traffic between its ports and accumulates per-device
//! residence time into the correction field. Run `tclockd --help` for
//! usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod daemon;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::TcConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run => {
            let config = config::TcConfig::load(&cli.config)?;
            daemon::run(&config)?;
        }
    }

    Ok(())
}
