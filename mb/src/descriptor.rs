//! Node descriptors: the immutable record each spawned process receives
//!
//! A descriptor carries everything a remote process needs to configure
//! itself: identity, role, engine, network binding, its neighbours or
//! attached brokers, and the run-context labels used to name its output.
//! Descriptors are created once per run by the realizer and never mutated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::workload::PsAction;

/// What a node is in the benchmark network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Broker,
    Client,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "broker" | "b" => Ok(Self::Broker),
            "client" | "c" => Ok(Self::Client),
            _ => Err(format!("Unknown role: {}. Use: broker or client", s)),
        }
    }
}

/// Transport the pub/sub engine should bind its listeners on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for NetworkProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("Unknown protocol: {}. Use: tcp or udp", s)),
        }
    }
}

/// Which pub/sub engine implementation a node should drive
///
/// The engine itself is an external collaborator behind
/// [`crate::agent::engine::PubSubEngine`]; this tag only selects the
/// implementation inside the spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// In-process topic-matching engine, used by tests and smoke runs
    Loopback,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loopback" => Ok(Self::Loopback),
            _ => Err(format!("Unknown engine: {}", s)),
        }
    }
}

/// Labels stamped into every descriptor of a run
///
/// These fields exist purely so each node can name its own output
/// consistently; control logic never branches on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// Identifier of the topology being benchmarked (file stem)
    pub topology: String,

    /// Whether this run spans multiple machines
    pub distributed: bool,

    /// Length of the timed window, in seconds
    #[serde(rename = "run-length-secs")]
    pub run_length_secs: u64,

    /// 1-based index of this run within its experiment
    #[serde(rename = "run-number")]
    pub run_number: u32,
}

impl RunContext {
    /// The context prefix shared by every node of this run:
    /// `<topology>_<L|D>_<protocol>_<len>s_r<run>`
    pub fn label(&self, protocol: NetworkProtocol) -> String {
        let flag = if self.distributed { "D" } else { "L" };
        format!(
            "{}_{}_{}_{}s_r{}",
            self.topology, flag, protocol, self.run_length_secs, self.run_number
        )
    }
}

/// The immutable record sent to a spawned process over the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node name, unique within a run
    pub name: String,

    pub role: NodeRole,

    pub engine: EngineKind,

    pub protocol: NetworkProtocol,

    /// Host this node runs on (brokers bind here)
    pub host: String,

    /// Port assigned to this node's engine listener (brokers only use it)
    pub port: u16,

    /// Broker-only: URIs of the neighbouring brokers to link with
    #[serde(rename = "neighbour-uris", default, skip_serializing_if = "Vec::is_empty")]
    pub neighbour_uris: Vec<String>,

    /// Client-only: URIs of the broker(s) this client attaches to
    #[serde(rename = "attached-uris", default, skip_serializing_if = "Vec::is_empty")]
    pub attached_uris: Vec<String>,

    /// Client-only: the timed action schedule to execute
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workload: Vec<PsAction>,

    pub context: RunContext,
}

impl NodeDescriptor {
    /// The engine URI of this node: `<protocol>://<host>:<port>`
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// The full context string naming this node's artifacts.
    pub fn context_string(&self) -> String {
        format!("{}_{}", self.context.label(self.protocol), self.name)
    }
}

/// Orchestrator-held mapping from node name to descriptor
///
/// Built once per run from the realizer's output and read-only for the
/// lifetime of one coordination-server session.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        let nodes = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        Self { nodes }
    }

    pub fn get(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn broker_count(&self) -> usize {
        self.nodes.values().filter(|d| d.role == NodeRole::Broker).count()
    }

    pub fn client_count(&self) -> usize {
        self.nodes.values().filter(|d| d.role == NodeRole::Client).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }
}
