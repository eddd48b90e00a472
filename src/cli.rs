// CLI module - command-line argument parsing
//
// The run is described by the YAML config file; the flags here only locate
// that file and override the odd knob for one-off runs.

use crate::config::VERSION;
use clap::Parser;
use std::path::PathBuf;

/// simweave - reconstructs causal traces from co-simulation logs
#[derive(Parser, Debug)]
#[command(name = "simweave")]
#[command(version = VERSION)]
#[command(about = "Stitch simulator logs into causally ordered traces", long_about = None)]
pub struct Cli {
    /// Path to the run configuration (YAML)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the sink with a JSON Lines file
    #[arg(long)]
    pub jsonl: Option<PathBuf>,

    /// Only load and validate the configuration, then exit
    #[arg(long)]
    pub check: bool,
}
