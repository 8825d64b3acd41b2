//! Spawning and tracking the per-node OS processes
//!
//! One process per descriptor, launched either as a local `mb-node`
//! invocation or through a remote-shell wrapper for distributed runs. The
//! launcher owns every child handle for the duration of a run: it can poll
//! their liveness for the monitor, kill the lot, and forget them before the
//! next run index.

use std::collections::HashMap;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::descriptor::{NodeDescriptor, NodeRegistry, NodeRole};
use crate::error::NodeExit;

/// Why launching a run's process set failed
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Couldn't spawn process for node {node}: {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Distributed run requested but no username configured")]
    MissingUsername,
}

/// A node that exited with a nonzero status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub name: String,
    pub role: NodeRole,
    /// Exit code if the process exited, None if it died to a signal
    pub code: Option<i32>,
}

impl NodeFailure {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("{} exited {} ({})", self.name, code, NodeExit::describe(code)),
            None => format!("{} killed by signal", self.name),
        }
    }
}

/// One liveness observation over the tracked process set
#[derive(Debug, Clone, Default)]
pub struct ProcessObservation {
    pub brokers_alive: usize,
    pub clients_alive: usize,
    pub failures: Vec<NodeFailure>,
}

struct NodeProcess {
    child: Child,
    role: NodeRole,
}

/// Spawns and tracks one OS process per node descriptor
pub struct ProcessLauncher {
    config: LaunchConfig,
    master_host: String,
    master_port: u16,
    username: Option<String>,
    distributed: bool,
    processes: HashMap<String, NodeProcess>,
}

impl ProcessLauncher {
    pub fn new(
        config: LaunchConfig,
        master_host: impl Into<String>,
        master_port: u16,
        username: Option<String>,
        distributed: bool,
    ) -> Self {
        Self {
            config,
            master_host: master_host.into(),
            master_port,
            username,
            distributed,
            processes: HashMap::new(),
        }
    }

    /// Build the invocation for one node, honoring the fixed argument
    /// contract: name, context, master host, master port, engine, role,
    /// and the username for distributed runs.
    fn command_for(&self, descriptor: &NodeDescriptor) -> Result<Command, LaunchError> {
        let mut command = if self.distributed {
            let username = self.username.as_deref().ok_or(LaunchError::MissingUsername)?;
            let mut cmd = Command::new(&self.config.remote_shell);
            cmd.arg(format!("{}@{}", username, descriptor.host));
            cmd.arg(&self.config.node_exe);
            cmd
        } else {
            Command::new(&self.config.node_exe)
        };

        command
            .arg(&descriptor.name)
            .arg(descriptor.context_string())
            .arg(&self.master_host)
            .arg(self.master_port.to_string())
            .arg(descriptor.engine.to_string())
            .arg(descriptor.role.to_string());

        if self.distributed {
            // Unwrap is safe: checked above
            command.arg(self.username.as_deref().unwrap_or_default());
        }

        if !self.distributed
            && let Some(work_dir) = &self.config.work_dir
        {
            command.current_dir(work_dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        Ok(command)
    }

    /// Launch every node in the registry, brokers first.
    ///
    /// Any spawn failure rolls the launch back: everything already spawned
    /// is killed and forgotten before the error is returned.
    pub async fn start(&mut self, registry: &NodeRegistry) -> Result<(), LaunchError> {
        let mut ordered: Vec<&NodeDescriptor> = registry.iter().collect();
        ordered.sort_by_key(|d| (d.role != NodeRole::Broker, d.name.clone()));

        for descriptor in ordered {
            let mut command = match self.command_for(descriptor) {
                Ok(command) => command,
                Err(source) => {
                    self.kill_all().await;
                    self.clear();
                    return Err(source);
                }
            };
            match command.spawn() {
                Ok(child) => {
                    debug!(node = %descriptor.name, role = %descriptor.role, "Node process spawned");
                    self.processes.insert(
                        descriptor.name.clone(),
                        NodeProcess {
                            child,
                            role: descriptor.role,
                        },
                    );
                }
                Err(source) => {
                    warn!(node = %descriptor.name, %source, "Spawn failed, rolling back launch");
                    self.kill_all().await;
                    self.clear();
                    return Err(LaunchError::Spawn {
                        node: descriptor.name.clone(),
                        source,
                    });
                }
            }
        }

        info!(count = self.processes.len(), "All node processes launched");
        Ok(())
    }

    /// Observe liveness: exited processes are removed from the tracked set,
    /// nonzero exits are reported as failures.
    pub fn poll(&mut self) -> ProcessObservation {
        let mut observation = ProcessObservation::default();
        let mut finished = Vec::new();

        for (name, process) in &mut self.processes {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code();
                    if code != Some(0) {
                        observation.failures.push(NodeFailure {
                            name: name.clone(),
                            role: process.role,
                            code,
                        });
                    }
                    finished.push(name.clone());
                }
                Ok(None) => match process.role {
                    NodeRole::Broker => observation.brokers_alive += 1,
                    NodeRole::Client => observation.clients_alive += 1,
                },
                Err(source) => {
                    // Treat an unpollable child as dead and broken
                    warn!(node = %name, %source, "Couldn't poll node process");
                    observation.failures.push(NodeFailure {
                        name: name.clone(),
                        role: process.role,
                        code: None,
                    });
                    finished.push(name.clone());
                }
            }
        }

        for name in finished {
            self.processes.remove(&name);
        }

        observation
    }

    /// SIGKILL-equivalent to every tracked process. Idempotent: processes
    /// that already exited are reaped silently.
    pub async fn kill_all(&mut self) {
        for (name, process) in &mut self.processes {
            #[cfg(unix)]
            if let Some(pid) = process.child.id() {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                if let Err(source) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    // Already gone; wait below reaps it
                    debug!(node = %name, pid, %source, "Kill skipped");
                }
            }
            #[cfg(not(unix))]
            if let Err(source) = process.child.start_kill() {
                debug!(node = %name, %source, "Kill skipped");
            }

            match process.child.wait().await {
                Ok(status) => debug!(node = %name, ?status, "Node process reaped"),
                Err(source) => warn!(node = %name, %source, "Couldn't reap node process"),
            }
        }
        info!(count = self.processes.len(), "Killed all tracked processes");
    }

    /// Best-effort sweep of remote machines after a distributed run: asks
    /// each machine to kill any node process the local handles couldn't
    /// reach (the local child is only the remote-shell wrapper).
    pub async fn sweep_remote(&self, machines: &[String]) {
        if !self.distributed {
            return;
        }
        let Some(username) = self.username.as_deref() else {
            return;
        };

        for machine in machines {
            let result = Command::new(&self.config.remote_shell)
                .arg(format!("{}@{}", username, machine))
                .arg("pkill")
                .arg("-9")
                .arg("-f")
                .arg(&self.config.node_exe)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match result {
                Ok(status) => debug!(%machine, ?status, "Remote sweep finished"),
                Err(source) => warn!(%machine, %source, "Remote sweep failed"),
            }
        }
    }

    /// Forget every handle, preparing the launcher for the next run index.
    pub fn clear(&mut self) {
        self.processes.clear();
    }

    /// Number of brokers currently tracked; sizes the post-kill cooldown.
    pub fn broker_count(&self) -> usize {
        self.processes.values().filter(|p| p.role == NodeRole::Broker).count()
    }

    pub fn tracked(&self) -> usize {
        self.processes.len()
    }
}
