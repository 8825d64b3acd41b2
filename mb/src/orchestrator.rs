//! Run sequencing: realize, launch, coordinate, monitor, tear down
//!
//! One benchmark executes a realized topology across one or more run
//! lengths, several runs each. Every run gets a fresh coordination-server
//! session and a fresh process set; teardown always kills everything and
//! waits out a cooldown scaled to the broker count before the next run
//! reuses the ports. No run is retried: the first failure ends the
//! benchmark with the remaining runs unattempted.

use std::collections::HashMap;
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::descriptor::{EngineKind, NetworkProtocol, NodeRegistry, RunContext};
use crate::launcher::ProcessLauncher;
use crate::monitor::{MonitorOutcome, RunMonitor};
use crate::server::CoordServer;
use crate::topology::{LogicalTopology, Machine, realize};
use crate::workload::PsAction;

/// Everything one benchmark invocation needs
pub struct BenchmarkPlan {
    /// Topology identifier used in run labels (usually the file stem)
    pub topology_name: String,
    pub topology: LogicalTopology,
    pub protocol: NetworkProtocol,
    pub engine: EngineKind,
    pub distributed: bool,
    pub machines: Vec<Machine>,
    pub workloads: HashMap<String, Vec<PsAction>>,
    pub username: Option<String>,
    pub run_lengths: Vec<Duration>,
    pub runs_per_length: u32,
}

/// The verdict on one run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The run's context label
    pub label: String,
    pub success: bool,
    pub detail: String,
}

/// What a whole benchmark produced
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub session: Uuid,
    pub runs: Vec<RunOutcome>,
}

impl BenchmarkReport {
    pub fn all_successful(&self) -> bool {
        !self.runs.is_empty() && self.runs.iter().all(|r| r.success)
    }
}

/// Drives benchmarks end to end
pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Execute every run of the plan. Setup problems (unusable topology,
    /// control socket) fail the call; a failed run ends the benchmark early
    /// with its outcome recorded in the report.
    pub async fn run_benchmark(&self, plan: BenchmarkPlan) -> Result<BenchmarkReport> {
        let session = Uuid::now_v7();
        info!(%session, topology = %plan.topology_name, protocol = %plan.protocol, "Benchmark starting");

        let machine_hosts: Vec<String> = plan.machines.iter().map(|m| m.host().to_string()).collect();
        let realized = realize(
            plan.topology,
            plan.protocol,
            plan.engine,
            plan.distributed,
            plan.machines,
            &plan.workloads,
        )
        .context("Couldn't realize topology")?;

        let monitor = RunMonitor::new(self.config.monitor.clone());
        let mut report = BenchmarkReport {
            session,
            runs: Vec::new(),
        };

        'benchmark: for run_length in &plan.run_lengths {
            for run_number in 1..=plan.runs_per_length {
                let context = RunContext {
                    topology: plan.topology_name.clone(),
                    distributed: plan.distributed,
                    run_length_secs: run_length.as_secs(),
                    run_number,
                };
                let label = context.label(realized.protocol());
                info!(%label, "Run starting");

                let registry = realized.descriptors(&context);
                let outcome = self
                    .execute_run(registry, *run_length, &monitor, plan.username.clone(), &machine_hosts)
                    .await;

                match outcome {
                    Ok(()) => {
                        info!(%label, "Run successful");
                        report.runs.push(RunOutcome {
                            label,
                            success: true,
                            detail: "completed".to_string(),
                        });
                    }
                    Err(reason) => {
                        // Alternate formatting keeps the whole cause chain
                        let detail = format!("{reason:#}");
                        error!(%label, %detail, "Run failed, ending benchmark");
                        report.runs.push(RunOutcome {
                            label,
                            success: false,
                            detail,
                        });
                        break 'benchmark;
                    }
                }
            }
        }

        Ok(report)
    }

    /// One run: server session, process launch, monitored window, teardown.
    async fn execute_run(
        &self,
        registry: NodeRegistry,
        run_length: Duration,
        monitor: &RunMonitor,
        username: Option<String>,
        machine_hosts: &[String],
    ) -> Result<()> {
        let distributed = username.is_some();
        let server = CoordServer::bind(self.config.control.clone(), registry.clone())
            .await
            .context("Couldn't bind coordination server")?;
        // The configured port may be 0 in tests; dial what was actually bound
        let control_port = server.local_addr().context("Control socket has no address")?.port();

        let mut launcher = ProcessLauncher::new(
            self.config.launch.clone(),
            self.config.control.advertise_host.clone(),
            control_port,
            username,
            distributed,
        );

        // The server must be accepting before the first process spawns
        let session = tokio::spawn(server.run());

        if let Err(source) = launcher.start(&registry).await {
            session.abort();
            self.teardown(&mut launcher, distributed, machine_hosts).await;
            return Err(source).context("Couldn't launch node processes");
        }

        // All nodes synchronized: descriptors delivered, brokers linked,
        // clients released
        match session.await {
            Ok(Ok(sync)) => {
                info!(brokers = sync.brokers, clients = sync.clients, "Nodes synchronized");
            }
            Ok(Err(server_error)) => {
                self.teardown(&mut launcher, distributed, machine_hosts).await;
                return Err(server_error).context("Coordination failed");
            }
            Err(join_error) => {
                self.teardown(&mut launcher, distributed, machine_hosts).await;
                return Err(join_error).context("Coordination session died");
            }
        }

        let outcome = monitor.watch(&mut launcher, run_length).await;
        self.teardown(&mut launcher, distributed, machine_hosts).await;

        match outcome {
            MonitorOutcome::Completed { floating_brokers } => {
                info!(floating_brokers, "Run completed");
                Ok(())
            }
            MonitorOutcome::Failed(failure) => Err(failure).context("Run aborted"),
        }
    }

    /// Kill whatever is still tracked, wait the broker-scaled cooldown,
    /// and forget the process set.
    async fn teardown(&self, launcher: &mut ProcessLauncher, distributed: bool, machine_hosts: &[String]) {
        let brokers_to_cool = launcher.broker_count();
        launcher.kill_all().await;
        if distributed {
            launcher.sweep_remote(machine_hosts).await;
        }

        let cooldown = self.config.monitor.cooldown(brokers_to_cool);
        if !cooldown.is_zero() {
            // Brokers need time to release their bound ports before the
            // next run reuses them
            info!(?cooldown, brokers = brokers_to_cool, "Cooling down");
            tokio::time::sleep(cooldown).await;
        }

        launcher.clear();
    }
}
