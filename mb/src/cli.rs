//! CLI command definitions for the orchestrator binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// meshbench - distributed pub/sub benchmark orchestrator
#[derive(Parser)]
#[command(
    name = "mb",
    about = "Realize a pub/sub topology as live processes and drive timed benchmark runs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Execute a benchmark: realize, launch, synchronize, monitor, tear down
    Run {
        /// Topology file (name role connections [workload] per line)
        #[arg(value_name = "TOPOLOGY")]
        topology: PathBuf,

        /// Workload files referenced by the topology's clients
        #[arg(short, long = "workload", value_name = "FILE", required = true)]
        workloads: Vec<PathBuf>,

        /// Network protocol for engine URIs
        #[arg(short, long, default_value = "tcp")]
        protocol: String,

        /// Pub/sub engine to drive
        #[arg(short, long, default_value = "loopback")]
        engine: String,

        /// Hosts file for a distributed run (host: ports per line)
        #[arg(long, value_name = "FILE")]
        hosts: Option<PathBuf>,

        /// Username for remote launches; required with --hosts
        #[arg(short, long)]
        user: Option<String>,

        /// Run length(s) in seconds; repeat for several lengths
        #[arg(short = 'l', long = "length", value_name = "SECS", default_values_t = [60u64])]
        lengths: Vec<u64>,

        /// Runs per length
        #[arg(short, long, default_value_t = 1)]
        runs: u32,
    },

    /// Validate a topology file without running anything
    Check {
        /// Topology file to validate
        #[arg(value_name = "TOPOLOGY")]
        topology: PathBuf,
    },
}
