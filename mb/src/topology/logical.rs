//! The abstract broker/client graph, independent of hosts and ports

use std::collections::{BTreeMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Problems with a logical topology that make it unusable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Broker {broker} references broker {missing} which doesn't exist")]
    MissingNeighbour { broker: String, missing: String },

    #[error("Client {client} attaches to broker {missing} which doesn't exist")]
    MissingAttachment { client: String, missing: String },

    #[error("Client {0} has no broker attachments")]
    UnattachedClient(String),

    #[error("Broker mesh is not fully reachable; {unreached} broker(s) unreachable from {from}")]
    Unreachable { from: String, unreached: usize },

    #[error("Topology has no brokers")]
    NoBrokers,
}

/// A broker adjacency pair whose reverse edge is missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReverseEdge {
    /// The broker missing an edge
    pub broker: String,
    /// The neighbour it fails to reciprocate
    pub neighbour: String,
}

/// Named broker nodes with adjacency, plus client-to-broker attachments
///
/// BTreeMaps keep node iteration deterministic, which keeps port
/// assignment reproducible run over run.
#[derive(Debug, Clone, Default)]
pub struct LogicalTopology {
    brokers: BTreeMap<String, Vec<String>>,
    clients: BTreeMap<String, ClientNotes>,
}

/// What the topology knows about one client
#[derive(Debug, Clone, Default)]
pub struct ClientNotes {
    /// Brokers this client attaches to
    pub attachments: Vec<String>,
    /// Name of the workload schedule this client runs
    pub workload: String,
}

impl LogicalTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broker(&mut self, name: impl Into<String>, neighbours: Vec<String>) {
        self.brokers.insert(name.into(), neighbours);
    }

    pub fn add_client(&mut self, name: impl Into<String>, attachments: Vec<String>, workload: impl Into<String>) {
        self.clients.insert(
            name.into(),
            ClientNotes {
                attachments,
                workload: workload.into(),
            },
        );
    }

    pub fn brokers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.brokers
    }

    pub fn clients(&self) -> &BTreeMap<String, ClientNotes> {
        &self.clients
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Find adjacency edges that are not reciprocated.
    ///
    /// A neighbour reference to a nonexistent broker is an error; a missing
    /// reverse edge is merely reported, so the caller can decide to
    /// symmetrize with [`force_mutual_connectivity`](Self::force_mutual_connectivity).
    pub fn confirm_mutual_connectivity(&self) -> Result<Vec<MissingReverseEdge>, TopologyError> {
        let mut missing = Vec::new();

        for (broker, neighbours) in &self.brokers {
            for neighbour in neighbours {
                let Some(reverse) = self.brokers.get(neighbour) else {
                    return Err(TopologyError::MissingNeighbour {
                        broker: broker.clone(),
                        missing: neighbour.clone(),
                    });
                };
                if !reverse.contains(broker) {
                    warn!(%broker, %neighbour, "Neighbour does not reciprocate connection");
                    missing.push(MissingReverseEdge {
                        broker: neighbour.clone(),
                        neighbour: broker.clone(),
                    });
                }
            }
        }

        Ok(missing)
    }

    /// Insert every missing reverse edge, making the adjacency mutual.
    pub fn force_mutual_connectivity(&mut self) -> Result<(), TopologyError> {
        let missing = self.confirm_mutual_connectivity()?;
        if missing.is_empty() {
            debug!("All brokers already mutually connected");
            return Ok(());
        }

        for edge in &missing {
            if let Some(neighbours) = self.brokers.get_mut(&edge.broker) {
                neighbours.push(edge.neighbour.clone());
            }
        }

        info!(added = missing.len(), "Symmetrized broker adjacency");
        Ok(())
    }

    /// Check the whole topology is usable: the broker mesh is reachable via
    /// BFS from an arbitrary broker, and every client attaches to at least
    /// one existing broker.
    pub fn confirm_connectivity(&self) -> Result<(), TopologyError> {
        let Some(start) = self.brokers.keys().next() else {
            return Err(TopologyError::NoBrokers);
        };

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            let Some(neighbours) = self.brokers.get(current) else {
                continue;
            };
            for neighbour in neighbours {
                if !self.brokers.contains_key(neighbour.as_str()) {
                    return Err(TopologyError::MissingNeighbour {
                        broker: current.to_string(),
                        missing: neighbour.clone(),
                    });
                }
                if visited.insert(neighbour) {
                    queue.push_back(neighbour);
                }
            }
        }

        if visited.len() != self.brokers.len() {
            return Err(TopologyError::Unreachable {
                from: start.to_string(),
                unreached: self.brokers.len() - visited.len(),
            });
        }

        for (client, notes) in &self.clients {
            if notes.attachments.is_empty() {
                return Err(TopologyError::UnattachedClient(client.clone()));
            }
            for attachment in &notes.attachments {
                if !self.brokers.contains_key(attachment) {
                    return Err(TopologyError::MissingAttachment {
                        client: client.clone(),
                        missing: attachment.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
