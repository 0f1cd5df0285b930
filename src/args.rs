// Commandline argument parser using clap for 4CT

use clap::Parser;
use std::path::PathBuf;

/// Rotate four song channels over four perch speakers on a daily schedule
/// and play them when a bird lands
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct FourCtArgs {
    /// Experiment configuration file (RON). Built-in defaults are used
    /// without one
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial port of the perch controller, instead of trying every port
    #[arg(short, long)]
    pub port: Option<PathBuf>,

    /// Pick the serial port from a list of the ports on this machine
    #[arg(long, conflicts_with = "port")]
    pub choose_port: bool,

    /// Baud rate, overriding the configuration. 9600 or 115200
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Run against a simulated controller that reports random crossings
    #[arg(long)]
    pub simulate: bool,

    /// Mean time between simulated crossings, in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub sim_interval_ms: u64,

    /// Take commands on stdin instead of showing the monitor
    #[arg(long)]
    pub headless: bool,

    /// Directory the log and count snapshots are written to on exit
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}
