//! meshbench - distributed pub/sub benchmark orchestration
//!
//! meshbench drives repeatable, timed benchmark runs of a publish/subscribe
//! network by spawning one OS process per broker and client, possibly
//! across machines, and walking them through a barrier-synchronized
//! startup: descriptors delivered over a control socket, the broker mesh
//! fully linked before any client acts, every client parked before any
//! client runs. A monitored timed window follows, then an unconditional
//! teardown with a broker-scaled cooldown.
//!
//! # Modules
//!
//! - [`topology`] - logical graph, machines/ports, realization into descriptors
//! - [`descriptor`] - the immutable per-node record and per-run registry
//! - [`wire`] - control-socket tokens and the versioned descriptor frame
//! - [`launcher`] - per-node OS process spawning and tracking
//! - [`server`] - the per-run TCP rendezvous and its barriers
//! - [`agent`] - the bootstrap logic inside every spawned process
//! - [`monitor`] - liveness polling and the run verdict
//! - [`orchestrator`] - realize, launch, coordinate, monitor, tear down

pub mod agent;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod launcher;
pub mod monitor;
pub mod orchestrator;
pub mod server;
pub mod topology;
pub mod wire;
pub mod workload;

// Re-export commonly used types
pub use config::{Config, ControlConfig, LaunchConfig, MonitorConfig};
pub use descriptor::{EngineKind, NetworkProtocol, NodeDescriptor, NodeRegistry, NodeRole, RunContext};
pub use error::NodeExit;
pub use launcher::{LaunchError, NodeFailure, ProcessLauncher, ProcessObservation};
pub use monitor::{MonitorFailure, MonitorOutcome, RunMonitor, RunState};
pub use orchestrator::{BenchmarkPlan, BenchmarkReport, Orchestrator, RunOutcome};
pub use server::{CoordServer, ServerError, SyncReport};
pub use topology::{LogicalTopology, Machine, RealizedTopology, realize};
pub use workload::PsAction;
