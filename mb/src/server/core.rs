//! The per-run coordination server
//!
//! One instance per run. Accepts exactly one connection per registered
//! node, spawns a handler for each, and sequences the run-level barriers:
//! brokers linked, objects delivered, clients ready, then the start gate.
//! Any handler failure cancels every blocked peer; the server joins all
//! handlers before reporting the run failed.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::handler::{self, HandlerError, SharedRun};
use super::latch::{CancelToken, Gate, Latch, WaitError};
use crate::config::ControlConfig;
use crate::descriptor::NodeRegistry;

/// Why a coordination session failed
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Couldn't bind control socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Couldn't accept node connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Run cancelled while sequencing barriers: {0}")]
    Sequencing(WaitError),

    #[error("{} handler(s) failed; first: {}", failures.len(), failures[0])]
    Handlers { failures: Vec<HandlerError> },
}

/// What a successful session synchronized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub brokers: usize,
    pub clients: usize,
}

/// TCP rendezvous service for one benchmark run
pub struct CoordServer {
    listener: TcpListener,
    registry: Arc<NodeRegistry>,
    config: ControlConfig,
}

impl CoordServer {
    /// Bind the control socket. The listener is live once this returns, so
    /// processes may be launched immediately afterwards.
    pub async fn bind(config: ControlConfig, registry: NodeRegistry) -> Result<Self, ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        info!(port = config.port, nodes = registry.len(), "Coordination server bound");
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            config,
        })
    }

    /// The actual bound address (useful when the configured port is 0).
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Run one coordination session to completion.
    ///
    /// Resolves once every handler has unwound: either all nodes reached
    /// their final phase (brokers linked and closed, clients released), or
    /// the run failed and every blocked peer was cancelled.
    pub async fn run(self) -> Result<SyncReport, ServerError> {
        let brokers = self.registry.broker_count();
        let clients = self.registry.client_count();
        let total = brokers + clients;

        let shared = Arc::new(SharedRun {
            registry: Arc::clone(&self.registry),
            objects_delivered: Latch::new(total),
            brokers_started: Latch::new(brokers),
            brokers_linked: Latch::new(brokers),
            clients_ready: Latch::new(clients),
            start: Gate::new(),
            cancel: CancelToken::new(),
            phase_timeout: self.config.phase_timeout(),
        });

        let mut handlers: JoinSet<Result<String, HandlerError>> = JoinSet::new();
        let mut accept_error = None;

        // Exactly one connection per registered node
        for pending in (1..=total).rev() {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, pending = pending - 1, "Node connection accepted");
                        let shared = Arc::clone(&shared);
                        // The failing handler fires the cancellation itself,
                        // so peers (and this accept loop) unblock immediately
                        handlers.spawn(async move {
                            let result = handler::handle_node(stream, Arc::clone(&shared)).await;
                            if result.is_err() {
                                shared.cancel.cancel();
                            }
                            result
                        });
                    }
                    Err(source) => {
                        error!(%source, "Accept failed, cancelling run");
                        shared.cancel.cancel();
                        accept_error = Some(ServerError::Accept(source));
                        break;
                    }
                },
                _ = shared.cancel.cancelled() => {
                    warn!(pending, "Run cancelled while awaiting connections");
                    break;
                }
            }
        }
        drop(self.listener);

        // Sequence the run-level barriers; handler failures cancel these
        let sequencing = async {
            shared.brokers_linked.wait(&shared.cancel, None).await?;
            debug!("All brokers linked");
            shared.objects_delivered.wait(&shared.cancel, None).await?;
            debug!("All descriptors delivered");
            shared.clients_ready.wait(&shared.cancel, None).await?;
            debug!("All clients parked");
            shared.start.open();
            info!("Start signal released");
            Ok::<(), WaitError>(())
        };

        // Join handlers concurrently with sequencing: a failing handler
        // must be able to cancel a barrier the sequencer is blocked on
        let mut failures: Vec<HandlerError> = Vec::new();
        let mut sequencing = std::pin::pin!(sequencing);
        let mut sequencing_result: Option<Result<(), WaitError>> = None;

        loop {
            tokio::select! {
                result = &mut sequencing, if sequencing_result.is_none() => {
                    sequencing_result = Some(result);
                }
                joined = handlers.join_next() => match joined {
                    Some(Ok(Ok(name))) => debug!(node = %name, "Handler finished"),
                    Some(Ok(Err(failure))) => {
                        error!(%failure, "Handler failed, cancelling run");
                        shared.cancel.cancel();
                        failures.push(failure);
                    }
                    Some(Err(join_error)) => {
                        error!(%join_error, "Handler panicked, cancelling run");
                        shared.cancel.cancel();
                    }
                    None => break,
                },
            }
        }

        if let Some(source) = accept_error {
            return Err(source);
        }
        if !failures.is_empty() {
            return Err(ServerError::Handlers { failures });
        }
        match sequencing_result {
            Some(Err(wait_error)) => Err(ServerError::Sequencing(wait_error)),
            // All handlers succeeded, so the barriers must have cleared
            None | Some(Ok(())) => {
                info!(brokers, clients, "All nodes synchronized");
                Ok(SyncReport { brokers, clients })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EngineKind, NetworkProtocol, NodeDescriptor, NodeRole, RunContext};
    use crate::wire;
    use rand::prelude::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn context() -> RunContext {
        RunContext {
            topology: "pair".to_string(),
            distributed: false,
            run_length_secs: 1,
            run_number: 1,
        }
    }

    fn node(name: &str, role: NodeRole) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            role,
            engine: EngineKind::Loopback,
            protocol: NetworkProtocol::Tcp,
            host: "localhost".to_string(),
            port: 1100,
            neighbour_uris: vec![],
            attached_uris: vec![],
            workload: vec![],
            context: context(),
        }
    }

    fn registry(brokers: &[&str], clients: &[&str]) -> NodeRegistry {
        let mut all = Vec::new();
        for name in brokers {
            all.push(node(name, NodeRole::Broker));
        }
        for name in clients {
            all.push(node(name, NodeRole::Client));
        }
        NodeRegistry::new(all)
    }

    async fn bind_server(registry: NodeRegistry) -> (CoordServer, SocketAddr) {
        let config = ControlConfig {
            port: 0,
            ..Default::default()
        };
        let server = CoordServer::bind(config, registry).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// A well-behaved broker node, driven over a raw socket.
    ///
    /// `unlinked` is decremented immediately before LINKED goes out, so a
    /// client observing zero knows every broker at least reached its link
    /// acknowledgement.
    async fn good_broker(
        addr: SocketAddr,
        name: &str,
        unlinked: Arc<std::sync::atomic::AtomicUsize>,
    ) -> NodeDescriptor {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        wire::send_token(&mut writer, name).await.unwrap();
        let descriptor = wire::read_descriptor(&mut reader).await.unwrap();
        wire::send_token(&mut writer, wire::TOKEN_INIT).await.unwrap();
        wire::expect_token(&mut reader, wire::TOKEN_LINK).await.unwrap();
        unlinked.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        wire::send_token(&mut writer, wire::TOKEN_LINKED).await.unwrap();
        descriptor
    }

    /// A well-behaved client node. Returns true once START was received.
    async fn good_client(addr: SocketAddr, name: &str, linked_probe: Arc<std::sync::atomic::AtomicUsize>) -> bool {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        wire::send_token(&mut writer, name).await.unwrap();
        let _descriptor = wire::read_descriptor(&mut reader).await.unwrap();
        // The descriptor only arrives after every broker linked
        assert_eq!(
            linked_probe.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "client {name} got its descriptor while a broker was still unlinked"
        );
        wire::send_token(&mut writer, wire::TOKEN_INIT).await.unwrap();
        wire::expect_token(&mut reader, wire::TOKEN_START).await.unwrap();
        true
    }

    #[tokio::test]
    async fn test_full_session_two_brokers_one_client() {
        let (server, addr) = bind_server(registry(&["b1", "b2"], &["c1"])).await;
        let server_task = tokio::spawn(server.run());

        let unlinked = Arc::new(std::sync::atomic::AtomicUsize::new(2));

        let probe = Arc::clone(&unlinked);
        let b1 = tokio::spawn(async move { good_broker(addr, "b1", probe).await });
        let probe = Arc::clone(&unlinked);
        let b2 = tokio::spawn(async move { good_broker(addr, "b2", probe).await });
        let probe = Arc::clone(&unlinked);
        let c1 = tokio::spawn(async move { good_client(addr, "c1", probe).await });

        let report = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report, SyncReport { brokers: 2, clients: 1 });

        assert_eq!(b1.await.unwrap().name, "b1");
        assert_eq!(b2.await.unwrap().name, "b2");
        assert!(c1.await.unwrap());
    }

    #[tokio::test]
    async fn test_ordering_invariant_under_random_arrival() {
        // No client may see its descriptor before every broker reported
        // LINKED, whatever order connections arrive in
        for seed in 0..5u64 {
            let (server, addr) = bind_server(registry(&["b1", "b2", "b3"], &["c1", "c2"])).await;
            let server_task = tokio::spawn(server.run());

            let unlinked = Arc::new(std::sync::atomic::AtomicUsize::new(3));
            let mut order: Vec<&str> = vec!["b1", "b2", "b3", "c1", "c2"];
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);

            let mut tasks = Vec::new();
            for name in order {
                let probe = Arc::clone(&unlinked);
                let delay = Duration::from_millis(rng.random_range(0..20));
                tasks.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if name.starts_with('b') {
                        good_broker(addr, name, probe).await;
                    } else {
                        good_client(addr, name, probe).await;
                    }
                }));
            }

            tokio::time::timeout(Duration::from_secs(5), server_task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            for task in tasks {
                task.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_node_name_fails_run() {
        let (server, addr) = bind_server(registry(&["b1"], &["c1"])).await;
        let server_task = tokio::spawn(server.run());

        let ghost = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            wire::send_token(&mut writer, "ghost").await.unwrap();
            // Keep the socket open so only the registry miss can fail us
            let mut reader = BufReader::new(read_half);
            let _ = wire::read_descriptor(&mut reader).await;
        });
        // A real client that would otherwise block forever on brokers_linked
        let parked = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            wire::send_token(&mut writer, "c1").await.unwrap();
            let mut reader = BufReader::new(read_half);
            wire::read_descriptor(&mut reader).await
        });

        let result = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("blocked peers must unblock on failure")
            .unwrap();
        match result {
            Err(ServerError::Handlers { failures }) => {
                assert!(failures.iter().any(|f| f.node == "ghost"));
            }
            other => panic!("Expected handler failure, got {:?}", other.map(|_| ())),
        }

        ghost.await.unwrap();
        // The parked client's socket closes without a descriptor
        assert!(parked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connection_drop_mid_handshake_unblocks_peers() {
        let (server, addr) = bind_server(registry(&["b1", "b2"], &["c1"])).await;
        let server_task = tokio::spawn(server.run());

        // b1 connects, identifies, then dies before INIT
        let dying = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_read_half, mut writer) = stream.into_split();
            wire::send_token(&mut writer, "b1").await.unwrap();
            writer.shutdown().await.unwrap();
        });
        // b2 behaves until the cancellation reaches it
        let survivor = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            wire::send_token(&mut writer, "b2").await.unwrap();
            let _ = wire::read_descriptor(&mut reader).await;
            let _ = wire::send_token(&mut writer, wire::TOKEN_INIT).await;
            // LINK never comes; the socket closes instead
            let _ = wire::expect_token(&mut reader, wire::TOKEN_LINK).await;
        });
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            wire::send_token(&mut writer, "c1").await.unwrap();
            let mut reader = BufReader::new(read_half);
            let _ = wire::read_descriptor(&mut reader).await;
        });

        let result = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("no permanent deadlock under single-point failure")
            .unwrap();
        assert!(result.is_err());

        dying.await.unwrap();
        survivor.await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_error_token_fails_fast() {
        let (server, addr) = bind_server(registry(&["b1"], &[])).await;
        let server_task = tokio::spawn(server.run());

        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            wire::send_token(&mut writer, "b1").await.unwrap();
            let _ = wire::read_descriptor(&mut reader).await.unwrap();
            // Engine create failed: report and bail
            wire::send_token(&mut writer, wire::TOKEN_ERROR).await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(ServerError::Handlers { failures }) => assert_eq!(failures[0].node, "b1"),
            other => panic!("Expected handler failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_failure_during_accept_phase_unblocks_server() {
        let (server, addr) = bind_server(registry(&["b1", "b2"], &[])).await;
        let server_task = tokio::spawn(server.run());

        // Only b1 ever connects, and it dies mid-handshake; b2's connection
        // never arrives, so the accept loop must be released by the failure
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        wire::send_token(&mut writer, "b1").await.unwrap();
        drop(writer);
        drop(read_half);

        let result = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server must not wait forever for the missing node")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_brokers_only_session() {
        let (server, addr) = bind_server(registry(&["b1"], &[])).await;
        let server_task = tokio::spawn(server.run());

        let probe = Arc::new(std::sync::atomic::AtomicUsize::new(1));
        tokio::spawn(async move {
            good_broker(addr, "b1", probe).await;
        });

        let report = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report, SyncReport { brokers: 1, clients: 0 });
    }
}
