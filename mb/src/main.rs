//! meshbench orchestrator CLI entry point

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::info;

use meshbench::cli::{Cli, Command};
use meshbench::config::Config;
use meshbench::descriptor::{EngineKind, NetworkProtocol};
use meshbench::orchestrator::{BenchmarkPlan, Orchestrator};
use meshbench::topology::{self, Machine};
use meshbench::workload;

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            topology,
            workloads,
            protocol,
            engine,
            hosts,
            user,
            lengths,
            runs,
        } => {
            cmd_run(
                &config, &topology, &workloads, &protocol, &engine, hosts, user, &lengths, runs,
            )
            .await
        }
        Command::Check { topology } => cmd_check(&topology),
    }
}

/// Validate a topology file and report what it describes.
fn cmd_check(path: &PathBuf) -> Result<()> {
    let mut topology = topology::parse_topology_file(path).context("Topology file unusable")?;

    let missing = topology
        .confirm_mutual_connectivity()
        .map_err(|e| eyre!(e))
        .context("Broker adjacency broken")?;
    for edge in &missing {
        println!(
            "{} {} does not reciprocate {}'s connection",
            "note:".yellow(),
            edge.broker,
            edge.neighbour
        );
    }
    topology.force_mutual_connectivity().map_err(|e| eyre!(e))?;
    topology.confirm_connectivity().map_err(|e| eyre!(e)).context("Topology not usable")?;

    println!(
        "{} {} broker(s), {} client(s), fully connected",
        "ok:".green(),
        topology.broker_count(),
        topology.client_count()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config: &Config,
    topology_path: &PathBuf,
    workload_paths: &[PathBuf],
    protocol: &str,
    engine: &str,
    hosts: Option<PathBuf>,
    user: Option<String>,
    lengths: &[u64],
    runs: u32,
) -> Result<()> {
    let protocol: NetworkProtocol = protocol.parse().map_err(|e: String| eyre!(e))?;
    let engine: EngineKind = engine.parse().map_err(|e: String| eyre!(e))?;

    let topology = topology::parse_topology_file(topology_path).context("Topology file unusable")?;
    let topology_name = topology_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "topology".to_string());

    let workloads = workload::load_workloads(workload_paths).context("Workload files unusable")?;

    let distributed = hosts.is_some();
    if distributed && user.is_none() {
        return Err(eyre!("--hosts requires --user for remote launches"));
    }
    let machines = match &hosts {
        Some(path) => {
            topology::parse_hosts_file(path, topology.broker_count()).context("Hosts file unusable")?
        }
        None => vec![Machine::local(topology.broker_count())],
    };

    let plan = BenchmarkPlan {
        topology_name,
        topology,
        protocol,
        engine,
        distributed,
        machines,
        workloads,
        username: user,
        run_lengths: lengths.iter().map(|&s| Duration::from_secs(s)).collect(),
        runs_per_length: runs,
    };

    let orchestrator = Orchestrator::new(config.clone());
    let report = orchestrator.run_benchmark(plan).await?;

    println!("session {}", report.session);
    for run in &report.runs {
        if run.success {
            println!("  {} {}", "PASS".green().bold(), run.label);
        } else {
            println!("  {} {} - {}", "FAIL".red().bold(), run.label, run.detail);
        }
    }

    if report.all_successful() {
        Ok(())
    } else {
        Err(eyre!("benchmark failed"))
    }
}
