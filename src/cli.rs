//! CLI definitions for tclockd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "tclockd",
    version,
    about = "IEEE 1588 peer-to-peer transparent clock daemon\n\nForwards PTP traffic between ports and folds the residence time of every\nSYNC/FOLLOW_UP pair into the correction field, so downstream clocks never\nsee this box's latency.",
    long_about = None
)]
pub struct Cli {
    /// Path to tclockd.toml config file
    #[clap(long, short, default_value = "tclockd.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the transparent clock (Ctrl-C to stop)
    Run,

    /// Print an example tclockd.toml to stdout
    Init,
}
