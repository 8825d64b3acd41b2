//! The pub/sub engine surface
//!
//! Engine wire behavior is an external concern: the orchestration layer
//! only needs the hooks below. What "linking" means is up to the engine;
//! an engine whose neighbour wiring is baked into broker startup is free
//! to implement [`PubSubEngine::link_neighbours`] as a no-op, the startup
//! ordering holds either way.
//!
//! [`LoopbackEngine`] is the built-in implementation: brokers bind a real
//! listener on their assigned port and neighbour links are real TCP
//! connects, so the startup ordering is exercised honestly, while client
//! pub/sub stays an in-process topic match.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::descriptor::{EngineKind, NodeDescriptor};

/// Errors surfaced by an engine hook
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine {op} failed: {reason}")]
    Operation { op: &'static str, reason: String },

    #[error("Engine asked to {0} in the wrong state")]
    InvalidState(&'static str),
}

impl EngineError {
    pub fn operation(op: &'static str, reason: impl ToString) -> Self {
        Self::Operation {
            op,
            reason: reason.to_string(),
        }
    }
}

/// A message handed to a client by its broker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload_size: usize,
    pub message_id: String,
}

/// Callback invoked for every delivery; must not block.
pub type DeliveryListener = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Engine-specific behavior behind the node bootstrap agent
#[async_trait]
pub trait PubSubEngine: Send {
    // Broker side
    async fn create_broker(&mut self, descriptor: &NodeDescriptor) -> Result<(), EngineError>;
    async fn start_broker(&mut self) -> Result<(), EngineError>;
    async fn link_neighbours(&mut self, neighbour_uris: &[String]) -> Result<(), EngineError>;
    /// Serve until torn down; a broker floats here until it is killed.
    async fn serve(&mut self) -> Result<(), EngineError>;

    // Client side
    async fn init_client(&mut self, descriptor: &NodeDescriptor, listener: DeliveryListener)
    -> Result<(), EngineError>;
    async fn advertise(&mut self, topic: &str) -> Result<(), EngineError>;
    async fn unadvertise(&mut self, topic: &str) -> Result<(), EngineError>;
    /// Returns the engine-assigned message id.
    async fn publish(&mut self, topic: &str, payload_size: usize) -> Result<String, EngineError>;
    async fn subscribe(&mut self, topic: &str) -> Result<(), EngineError>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), EngineError>;
    async fn disconnect(&mut self) -> Result<(), EngineError>;
    async fn shutdown(&mut self) -> Result<(), EngineError>;
}

/// Instantiate the engine implementation a descriptor asks for.
pub fn engine_for(kind: EngineKind) -> Box<dyn PubSubEngine> {
    match kind {
        EngineKind::Loopback => Box::new(LoopbackEngine::new()),
    }
}

/// Extract `(host, port)` from an engine URI like `tcp://host:1100`.
fn host_port(uri: &str) -> Option<(&str, u16)> {
    let rest = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let (host, port) = rest.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

/// The built-in in-process engine
#[derive(Default)]
pub struct LoopbackEngine {
    broker: Option<NodeDescriptor>,
    listener: Option<TcpListener>,
    neighbour_links: Vec<TcpStream>,
    attachment: Option<TcpStream>,
    subscriptions: HashSet<String>,
    advertisements: HashSet<String>,
    delivery: Option<DeliveryListener>,
    published: u64,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The port the broker listener actually bound, once started.
    pub fn bound_port(&self) -> Option<u16> {
        self.listener.as_ref()?.local_addr().ok().map(|addr| addr.port())
    }
}

#[async_trait]
impl PubSubEngine for LoopbackEngine {
    async fn create_broker(&mut self, descriptor: &NodeDescriptor) -> Result<(), EngineError> {
        if self.broker.is_some() {
            return Err(EngineError::InvalidState("create a second broker"));
        }
        self.broker = Some(descriptor.clone());
        Ok(())
    }

    async fn start_broker(&mut self) -> Result<(), EngineError> {
        let descriptor = self.broker.as_ref().ok_or(EngineError::InvalidState("start"))?;
        let listener = TcpListener::bind((descriptor.host.as_str(), descriptor.port))
            .await
            .map_err(|e| EngineError::operation("start", e))?;
        debug!(host = %descriptor.host, port = descriptor.port, "Loopback broker listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn link_neighbours(&mut self, neighbour_uris: &[String]) -> Result<(), EngineError> {
        if self.listener.is_none() {
            return Err(EngineError::InvalidState("link"));
        }
        for uri in neighbour_uris {
            let (host, port) = host_port(uri).ok_or_else(|| EngineError::operation("link", format!("bad URI {uri}")))?;
            // A real connect: fails unless the neighbour already bound its port
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| EngineError::operation("link", format!("{uri}: {e}")))?;
            self.neighbour_links.push(stream);
        }
        debug!(links = self.neighbour_links.len(), "Loopback broker linked");
        Ok(())
    }

    async fn serve(&mut self) -> Result<(), EngineError> {
        let listener = self.listener.as_ref().ok_or(EngineError::InvalidState("serve"))?;
        // Accept and hold connections until the process dies, so attached
        // peers see a live broker
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => held.push(stream),
                Err(e) => return Err(EngineError::operation("serve", e)),
            }
        }
    }

    async fn init_client(
        &mut self,
        descriptor: &NodeDescriptor,
        listener: DeliveryListener,
    ) -> Result<(), EngineError> {
        let uri = descriptor
            .attached_uris
            .first()
            .ok_or_else(|| EngineError::operation("init", "client has no attached broker"))?;
        let (host, port) = host_port(uri).ok_or_else(|| EngineError::operation("init", format!("bad URI {uri}")))?;
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| EngineError::operation("init", format!("{uri}: {e}")))?;
        self.attachment = Some(stream);
        self.delivery = Some(listener);
        Ok(())
    }

    async fn advertise(&mut self, topic: &str) -> Result<(), EngineError> {
        self.advertisements.insert(topic.to_string());
        Ok(())
    }

    async fn unadvertise(&mut self, topic: &str) -> Result<(), EngineError> {
        if !self.advertisements.remove(topic) {
            return Err(EngineError::operation("unadvertise", format!("{topic} not advertised")));
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload_size: usize) -> Result<String, EngineError> {
        if !self.advertisements.contains(topic) {
            return Err(EngineError::operation("publish", format!("{topic} not advertised")));
        }
        self.published += 1;
        let message_id = format!("loopback-{}", self.published);

        // In-process matching: deliveries loop straight back to this client
        if self.subscriptions.contains(topic)
            && let Some(listener) = &self.delivery
        {
            listener(Delivery {
                topic: topic.to_string(),
                payload_size,
                message_id: message_id.clone(),
            });
        }

        Ok(message_id)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), EngineError> {
        self.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), EngineError> {
        if !self.subscriptions.remove(topic) {
            return Err(EngineError::operation("unsubscribe", format!("{topic} not subscribed")));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.attachment = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.subscriptions.clear();
        self.advertisements.clear();
        self.delivery = None;
        self.neighbour_links.clear();
        self.listener = None;
        Ok(())
    }
}
