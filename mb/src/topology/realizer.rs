//! Turning a logical topology into concrete host/port-bound node specs
//!
//! Realization happens once per (topology, protocol) pairing: brokers draw
//! (host, port) pairs from the machine pool, neighbour and attachment URIs
//! are derived from the symmetrized adjacency, and clients pick up their
//! workload schedules. Per run, [`RealizedTopology::descriptors`] stamps the
//! run context and yields the immutable registry. A partial realization is
//! never returned.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info};

use super::logical::{LogicalTopology, TopologyError};
use super::machine::Machine;
use crate::descriptor::{EngineKind, NetworkProtocol, NodeDescriptor, NodeRegistry, NodeRole, RunContext};
use crate::workload::PsAction;

/// Why a realization failed as a whole
#[derive(Debug, Error)]
pub enum RealizeError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("No machines available to place nodes on")]
    NoMachines,

    #[error("Ran out of ports after placing {placed} of {needed} brokers")]
    OutOfPorts { placed: usize, needed: usize },

    #[error("Client {client} requests workload {workload} which was not supplied")]
    MissingWorkload { client: String, workload: String },
}

#[derive(Debug, Clone)]
struct BrokerSite {
    host: String,
    port: u16,
    neighbours: Vec<String>,
}

#[derive(Debug, Clone)]
struct ClientSite {
    host: String,
    attachments: Vec<String>,
    workload: Vec<PsAction>,
}

/// A logical topology bound to hosts and ports
///
/// Holds everything that is stable across the runs of one experiment; only
/// the run context changes between runs.
#[derive(Debug, Clone)]
pub struct RealizedTopology {
    protocol: NetworkProtocol,
    engine: EngineKind,
    distributed: bool,
    brokers: BTreeMap<String, BrokerSite>,
    clients: BTreeMap<String, ClientSite>,
}

impl RealizedTopology {
    pub fn protocol(&self) -> NetworkProtocol {
        self.protocol
    }

    pub fn distributed(&self) -> bool {
        self.distributed
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Which machine a node was placed on, for remote launch and kill.
    pub fn machine_of(&self, name: &str) -> Option<&str> {
        self.brokers
            .get(name)
            .map(|b| b.host.as_str())
            .or_else(|| self.clients.get(name).map(|c| c.host.as_str()))
    }

    fn broker_uri(&self, name: &str) -> String {
        let site = &self.brokers[name];
        format!("{}://{}:{}", self.protocol, site.host, site.port)
    }

    /// Build the immutable per-run registry with context labels stamped in.
    pub fn descriptors(&self, context: &RunContext) -> NodeRegistry {
        let mut all = Vec::with_capacity(self.brokers.len() + self.clients.len());

        for (name, site) in &self.brokers {
            all.push(NodeDescriptor {
                name: name.clone(),
                role: NodeRole::Broker,
                engine: self.engine,
                protocol: self.protocol,
                host: site.host.clone(),
                port: site.port,
                neighbour_uris: site.neighbours.iter().map(|n| self.broker_uri(n)).collect(),
                attached_uris: vec![],
                workload: vec![],
                context: context.clone(),
            });
        }

        for (name, site) in &self.clients {
            all.push(NodeDescriptor {
                name: name.clone(),
                role: NodeRole::Client,
                engine: self.engine,
                protocol: self.protocol,
                host: site.host.clone(),
                port: 0,
                neighbour_uris: vec![],
                attached_uris: site.attachments.iter().map(|a| self.broker_uri(a)).collect(),
                workload: site.workload.clone(),
                context: context.clone(),
            });
        }

        NodeRegistry::new(all)
    }
}

/// Draw the next (host, port) pair for a broker, round-robin over machines
/// that still have ports.
fn next_broker_site(machines: &mut [Machine], cursor: &mut usize) -> Option<(String, u16)> {
    let mut inspected = 0;
    while inspected < machines.len() {
        let machine = &mut machines[*cursor % machines.len()];
        if let Some(port) = machine.take_port() {
            let host = machine.host().to_string();
            *cursor = (*cursor + 1) % machines.len();
            return Some((host, port));
        }
        *cursor = (*cursor + 1) % machines.len();
        inspected += 1;
    }
    None
}

/// Pick a machine for a client; clients need no port, any machine will do.
fn next_client_host(machines: &[Machine], cursor: &mut usize) -> String {
    let host = machines[*cursor % machines.len()].host().to_string();
    *cursor = (*cursor + 1) % machines.len();
    host
}

/// Realize `topology` onto `machines`.
///
/// The adjacency is symmetrized first (non-reciprocated edges become
/// mutual), then the whole graph is checked for reachability and valid
/// client attachments before any node is placed.
pub fn realize(
    mut topology: LogicalTopology,
    protocol: NetworkProtocol,
    engine: EngineKind,
    distributed: bool,
    mut machines: Vec<Machine>,
    workloads: &HashMap<String, Vec<PsAction>>,
) -> Result<RealizedTopology, RealizeError> {
    topology.force_mutual_connectivity()?;
    topology.confirm_connectivity()?;

    if machines.is_empty() {
        return Err(RealizeError::NoMachines);
    }

    let needed = topology.broker_count();
    let mut cursor = 0usize;
    let mut brokers = BTreeMap::new();

    for (name, neighbours) in topology.brokers() {
        let Some((host, port)) = next_broker_site(&mut machines, &mut cursor) else {
            return Err(RealizeError::OutOfPorts {
                placed: brokers.len(),
                needed,
            });
        };
        debug!(broker = %name, %host, port, "Placed broker");
        brokers.insert(
            name.clone(),
            BrokerSite {
                host,
                port,
                neighbours: neighbours.clone(),
            },
        );
    }

    let mut clients = BTreeMap::new();
    for (name, notes) in topology.clients() {
        let workload = workloads
            .get(&notes.workload)
            .cloned()
            .ok_or_else(|| RealizeError::MissingWorkload {
                client: name.clone(),
                workload: notes.workload.clone(),
            })?;

        let host = next_client_host(&machines, &mut cursor);
        debug!(client = %name, %host, "Placed client");
        clients.insert(
            name.clone(),
            ClientSite {
                host,
                attachments: notes.attachments.clone(),
                workload,
            },
        );
    }

    info!(
        brokers = brokers.len(),
        clients = clients.len(),
        %protocol,
        distributed,
        "Topology realized"
    );

    Ok(RealizedTopology {
        protocol,
        engine,
        distributed,
        brokers,
        clients,
    })
}
