//! Run monitoring: deciding when a timed run finished, failed, or hung
//!
//! The orchestrator polls process liveness at a fixed fraction of the run
//! length. Before the deadline anything other than "all nodes running" is
//! an abort; after it, the client population is expected to drain, leaving
//! floating brokers (or nothing) behind.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::MonitorConfig;
use crate::launcher::{NodeFailure, ProcessLauncher, ProcessObservation};

/// What one liveness observation says about the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Brokers and clients both alive
    Running,
    /// Clients done, brokers still up
    FloatingBrokers,
    /// Nothing alive
    AllOff,
    /// A node failed, or clients outlived every broker
    Error,
}

/// Classify one observation.
pub fn classify(observation: &ProcessObservation) -> RunState {
    if !observation.failures.is_empty() {
        return RunState::Error;
    }
    match (observation.brokers_alive, observation.clients_alive) {
        (0, 0) => RunState::AllOff,
        (_, 0) => RunState::FloatingBrokers,
        (0, _) => RunState::Error,
        _ => RunState::Running,
    }
}

/// Why a monitored run was aborted
#[derive(Debug, Error)]
pub enum MonitorFailure {
    #[error("{} node(s) failed; first: {}", failures.len(), failures[0].describe())]
    NodeFailures { failures: Vec<NodeFailure> },

    #[error("Clients are alive but every broker is gone")]
    ClientsWithoutBrokers,

    #[error("Run finished early: {0:?} observed before the deadline")]
    FinishedEarly(RunState),
}

/// The verdict on one timed run
#[derive(Debug)]
pub enum MonitorOutcome {
    /// The run lasted its full length and the clients drained.
    /// `floating_brokers` is how many brokers are left to kill.
    Completed { floating_brokers: usize },
    Failed(MonitorFailure),
}

fn failure_for(observation: ProcessObservation) -> MonitorFailure {
    if observation.failures.is_empty() {
        MonitorFailure::ClientsWithoutBrokers
    } else {
        MonitorFailure::NodeFailures {
            failures: observation.failures,
        }
    }
}

/// Polls the launcher's process set for the duration of one run
pub struct RunMonitor {
    config: MonitorConfig,
}

impl RunMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Watch a started run to its verdict.
    ///
    /// The post-deadline drain wait is unbounded, like the rest of the
    /// control flow: a client that never exits stalls the benchmark rather
    /// than producing a truncated result.
    pub async fn watch(&self, launcher: &mut ProcessLauncher, run_length: Duration) -> MonitorOutcome {
        let poll = self.config.poll_interval(run_length);
        let deadline = Instant::now() + run_length;
        info!(?run_length, ?poll, "Monitoring run");

        // Timed window: everything must stay up until the deadline
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(poll.min(deadline - now)).await;

            let observation = launcher.poll();
            let state = classify(&observation);
            debug!(?state, brokers = observation.brokers_alive, clients = observation.clients_alive, "Polled");
            match state {
                RunState::Running => {}
                RunState::Error => {
                    error!("Run aborted by node failure");
                    return MonitorOutcome::Failed(failure_for(observation));
                }
                // Race at the boundary: the clients may legitimately have
                // drained in the instant the deadline passed
                RunState::FloatingBrokers | RunState::AllOff => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    error!(?state, "Run finished before its deadline");
                    return MonitorOutcome::Failed(MonitorFailure::FinishedEarly(state));
                }
            }
        }

        // Drain: wait for the client population to reach zero
        loop {
            let observation = launcher.poll();
            let state = classify(&observation);
            debug!(?state, clients = observation.clients_alive, "Draining");
            match state {
                RunState::Running => sleep(poll).await,
                RunState::Error => {
                    error!("Run aborted during drain");
                    return MonitorOutcome::Failed(failure_for(observation));
                }
                RunState::FloatingBrokers => {
                    info!(floating = observation.brokers_alive, "Clients drained");
                    return MonitorOutcome::Completed {
                        floating_brokers: observation.brokers_alive,
                    };
                }
                RunState::AllOff => {
                    info!("All nodes drained");
                    return MonitorOutcome::Completed { floating_brokers: 0 };
                }
            }
        }
    }
}
