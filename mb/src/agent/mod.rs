//! The node bootstrap agent
//!
//! Runs inside every spawned process. Parses the fixed positional argument
//! contract, dials the coordination server, identifies itself, receives its
//! descriptor, and dispatches by role. Every failure class exits with its
//! own code from [`crate::error::NodeExit`]; argument failures exit before
//! any network activity.

pub mod broker;
pub mod client;
pub mod engine;

use std::path::Path;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{error, info};

use crate::descriptor::{EngineKind, NodeDescriptor, NodeRole};
use crate::error::NodeExit;
use crate::wire::{self, WireError};
use engine::engine_for;

/// Positional argument contract: name, context, master host, master port,
/// engine, role, and a username only when the run is distributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeArgs {
    pub name: String,
    pub context: String,
    pub master_host: String,
    pub master_port: u16,
    pub engine: EngineKind,
    pub role: NodeRole,
    pub username: Option<String>,
}

impl NodeArgs {
    pub fn distributed(&self) -> bool {
        self.username.is_some()
    }

    /// Parse the positional contract (without the program name).
    ///
    /// The role is parsed first: once the actor is known, the remaining
    /// failures carry that actor's dedicated args code. Arguments so
    /// malformed the role itself is unknown exit [`NodeExit::Usage`].
    pub fn parse(args: &[String]) -> Result<Self, NodeExit> {
        if args.len() < 6 || args.len() > 7 {
            error!(got = args.len(), "Expected 6 or 7 positional arguments");
            return Err(NodeExit::Usage);
        }

        let role: NodeRole = match args[5].parse() {
            Ok(role) => role,
            Err(reason) => {
                error!(%reason, "Bad role argument");
                return Err(NodeExit::Usage);
            }
        };
        let args_exit = match role {
            NodeRole::Broker => NodeExit::BrokerArgs,
            NodeRole::Client => NodeExit::ClientArgs,
        };

        let master_port: u16 = args[3].parse().map_err(|_| {
            error!(port = %args[3], "Master port is not a port number");
            args_exit
        })?;
        let engine: EngineKind = args[4].parse().map_err(|reason: String| {
            error!(%reason, "Bad engine argument");
            args_exit
        })?;

        Ok(Self {
            name: args[0].clone(),
            context: args[1].clone(),
            master_host: args[2].clone(),
            master_port,
            engine,
            role,
            username: args.get(6).cloned(),
        })
    }
}

/// The agent's half of the control socket
pub struct MasterLink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MasterLink {
    pub async fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    pub async fn identify(&mut self, name: &str) -> Result<(), WireError> {
        wire::send_token(&mut self.writer, name).await
    }

    pub async fn receive_descriptor(&mut self) -> Result<NodeDescriptor, WireError> {
        wire::read_descriptor(&mut self.reader).await
    }

    pub async fn send_token(&mut self, token: &str) -> Result<(), WireError> {
        wire::send_token(&mut self.writer, token).await
    }

    pub async fn expect_token(&mut self, token: &'static str) -> Result<(), WireError> {
        wire::expect_token(&mut self.reader, token).await
    }

    /// Best-effort failure report so the server fails fast instead of
    /// waiting on a peer that is about to exit.
    pub async fn report_error(&mut self) {
        let _ = wire::send_token(&mut self.writer, wire::TOKEN_ERROR).await;
    }

    /// Host of the master this link is connected to.
    pub fn peer_host(&self) -> Option<String> {
        self.writer.peer_addr().ok().map(|addr| addr.ip().to_string())
    }
}

/// Run the bootstrap agent to completion, returning the process exit class.
pub async fn run(args: NodeArgs) -> NodeExit {
    let socket_exit = match args.role {
        NodeRole::Broker => NodeExit::BrokerSocket,
        NodeRole::Client => NodeExit::ClientSocket,
    };
    let descriptor_exit = match args.role {
        NodeRole::Broker => NodeExit::BrokerDescriptor,
        NodeRole::Client => NodeExit::ClientDescriptor,
    };

    let mut link = match MasterLink::connect(&args.master_host, args.master_port).await {
        Ok(link) => link,
        Err(source) => {
            error!(%source, host = %args.master_host, port = args.master_port, "Couldn't dial master");
            return socket_exit;
        }
    };

    if let Err(source) = link.identify(&args.name).await {
        error!(%source, "Couldn't send name to master");
        return socket_exit;
    }

    let descriptor = match link.receive_descriptor().await {
        Ok(descriptor) => descriptor,
        Err(source) => {
            error!(%source, node = %args.name, "Didn't receive descriptor from master");
            return descriptor_exit;
        }
    };
    if descriptor.name != args.name {
        error!(got = %descriptor.name, expected = %args.name, "Master sent a descriptor for someone else");
        return descriptor_exit;
    }
    info!(node = %descriptor.name, role = %descriptor.role, "Descriptor received");

    let mut engine = engine_for(args.engine);
    let result = match args.role {
        NodeRole::Broker => broker::run_broker(&mut link, engine.as_mut(), &descriptor).await,
        NodeRole::Client => {
            client::run_client(
                &mut link,
                engine.as_mut(),
                &descriptor,
                args.username.as_deref(),
                Path::new("."),
            )
            .await
        }
    };

    match result {
        Ok(()) => {
            info!(node = %descriptor.name, "Node finished cleanly");
            NodeExit::Success
        }
        Err(exit) => {
            error!(node = %descriptor.name, code = exit.code(), "Node failed");
            exit
        }
    }
}
