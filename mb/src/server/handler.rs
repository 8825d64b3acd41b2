//! Per-connection node handler
//!
//! One handler task per connected node, coordinated with its peers only
//! through the run's latches and the shared cancel token. The handler
//! enforces the startup ordering: no client receives its descriptor until
//! every broker has reported its neighbour links up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::latch::{CancelToken, Gate, Latch, WaitError};
use crate::descriptor::{NodeRegistry, NodeRole};
use crate::wire::{self, WireError};

/// Name used in errors raised before the node identified itself.
const UNIDENTIFIED: &str = "<unidentified>";

/// A handler failure, fatal to the whole run
#[derive(Debug, Error)]
#[error("Handler for {node}: {kind}")]
pub struct HandlerError {
    /// The node this handler served, if it got far enough to say
    pub node: String,
    #[source]
    pub kind: HandlerErrorKind,
}

#[derive(Debug, Error)]
pub enum HandlerErrorKind {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Name not present in the node registry")]
    UnknownNode,

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("Timed out in phase {0}")]
    PhaseTimeout(&'static str),
}

/// State shared by every handler of one coordination-server session
pub struct SharedRun {
    pub registry: Arc<NodeRegistry>,
    /// All nodes have received their descriptor
    pub objects_delivered: Latch,
    /// All brokers have started their engines
    pub brokers_started: Latch,
    /// All brokers have finished connecting to their neighbours
    pub brokers_linked: Latch,
    /// All clients are parked waiting to run
    pub clients_ready: Latch,
    /// Single-fire run start signal
    pub start: Gate,
    pub cancel: CancelToken,
    pub phase_timeout: Option<Duration>,
}

/// Bound an IO future by the optional phase timeout.
async fn phase<T>(
    node: &str,
    name: &'static str,
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, WireError>>,
) -> Result<T, HandlerError> {
    let wrap_kind = |kind: HandlerErrorKind| HandlerError {
        node: node.to_string(),
        kind,
    };

    match timeout {
        None => fut.await.map_err(|e| wrap_kind(e.into())),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| wrap_kind(e.into())),
            Err(_) => Err(wrap_kind(HandlerErrorKind::PhaseTimeout(name))),
        },
    }
}

/// Drive one node through the startup protocol.
///
/// Returns the node's name on success. Any error is fatal to the run; the
/// caller cancels the shared token so blocked peers unwind.
pub async fn handle_node(stream: TcpStream, shared: Arc<SharedRun>) -> Result<String, HandlerError> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let timeout = shared.phase_timeout;

    let name = phase(UNIDENTIFIED, "identify", timeout, wire::read_line(&mut reader)).await?;
    debug!(node = %name, "Node connected");

    let descriptor = shared.registry.get(&name).cloned().ok_or_else(|| HandlerError {
        node: name.clone(),
        kind: HandlerErrorKind::UnknownNode,
    })?;

    let wait_err = |kind: WaitError| HandlerError {
        node: name.clone(),
        kind: kind.into(),
    };

    match descriptor.role {
        NodeRole::Broker => {
            phase(&name, "object", timeout, wire::send_descriptor(&mut writer, &descriptor)).await?;
            shared.objects_delivered.count_down();

            phase(&name, "init", timeout, wire::expect_token(&mut reader, wire::TOKEN_INIT)).await?;
            debug!(node = %name, "Broker started");
            shared.brokers_started.count_down();

            // Linking only begins once every broker is up, so no neighbour
            // connection can race a broker that hasn't bound its port yet
            shared.brokers_started.wait(&shared.cancel, timeout).await.map_err(wait_err)?;

            phase(&name, "link", timeout, wire::send_token(&mut writer, wire::TOKEN_LINK)).await?;
            phase(&name, "linked", timeout, wire::expect_token(&mut reader, wire::TOKEN_LINKED)).await?;
            info!(node = %name, "Broker linked");
            shared.brokers_linked.count_down();
        }
        NodeRole::Client => {
            // Ordering invariant: clients see nothing until the broker mesh
            // is fully connected
            shared.brokers_linked.wait(&shared.cancel, timeout).await.map_err(wait_err)?;

            phase(&name, "object", timeout, wire::send_descriptor(&mut writer, &descriptor)).await?;
            shared.objects_delivered.count_down();

            phase(&name, "init", timeout, wire::expect_token(&mut reader, wire::TOKEN_INIT)).await?;
            debug!(node = %name, "Client ready");
            shared.clients_ready.count_down();

            shared.start.wait(&shared.cancel, timeout).await.map_err(wait_err)?;
            phase(&name, "start", timeout, wire::send_token(&mut writer, wire::TOKEN_START)).await?;
            info!(node = %name, "Client released");
        }
    }

    let _ = writer.shutdown().await;
    Ok(name)
}
