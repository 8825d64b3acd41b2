//! Client-side bootstrap and workload execution
//!
//! Initialize against the attached broker(s), acknowledge with INIT, park
//! until START, execute the timed action schedule while keeping the diary,
//! then disconnect, persist the diary, and ship it upstream when the run
//! is distributed.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info};

use rundiary::{ActionKind, DiaryRecord, SharedDiary};

use super::MasterLink;
use super::engine::{Delivery, PubSubEngine};
use crate::descriptor::{NodeDescriptor, NodeRole};
use crate::error::NodeExit;
use crate::wire;
use crate::workload::PsAction;

pub async fn run_client(
    link: &mut MasterLink,
    engine: &mut dyn PubSubEngine,
    descriptor: &NodeDescriptor,
    username: Option<&str>,
    out_dir: &Path,
) -> Result<(), NodeExit> {
    if descriptor.role != NodeRole::Client {
        error!(role = %descriptor.role, "Client agent given a non-client descriptor");
        link.report_error().await;
        return Err(NodeExit::ClientSetup);
    }

    let context = descriptor.context_string();
    let diary = SharedDiary::new(&context);
    // One epoch for schedule records and deliveries alike, so offsets in
    // the diary are mutually comparable
    let epoch = Instant::now();

    let listener = {
        let diary = diary.clone();
        Arc::new(move |delivery: Delivery| {
            let now_ns = epoch.elapsed().as_nanos() as u64;
            diary.append(DiaryRecord {
                kind: ActionKind::Receive,
                topic: delivery.topic,
                payload_size: Some(delivery.payload_size),
                occurred_at: Utc::now(),
                started_ns: now_ns,
                ended_ns: now_ns,
                message_id: Some(delivery.message_id),
            });
        })
    };

    if let Err(source) = engine.init_client(descriptor, listener).await {
        error!(%source, "Couldn't initialize client");
        link.report_error().await;
        return Err(NodeExit::ClientSetup);
    }
    debug!(brokers = descriptor.attached_uris.len(), "Client initialized");

    if let Err(source) = link.send_token(wire::TOKEN_INIT).await {
        error!(%source, "Couldn't acknowledge init");
        return Err(NodeExit::ClientSocket);
    }

    if let Err(source) = link.expect_token(wire::TOKEN_START).await {
        error!(%source, "Didn't receive start signal");
        return Err(NodeExit::ClientStart);
    }
    info!("Start signal received, running workload");

    let run_length = Duration::from_secs(descriptor.context.run_length_secs);
    if let Err(source) = execute_workload(engine, &descriptor.workload, run_length, &diary, epoch).await {
        error!(%source, "Workload failed");
        return Err(NodeExit::ClientRun);
    }
    info!(records = diary.len(), "Workload finished");

    if let Err(source) = engine.disconnect().await {
        error!(%source, "Couldn't disconnect");
        return Err(NodeExit::ClientCleanup);
    }
    if let Err(source) = engine.shutdown().await {
        error!(%source, "Couldn't shut engine down");
        return Err(NodeExit::ClientCleanup);
    }

    let artifact = match diary.take().save(out_dir) {
        Ok(path) => path,
        Err(source) => {
            error!(%source, "Couldn't write diary artifact");
            return Err(NodeExit::ClientDiary);
        }
    };
    info!(path = %artifact.display(), "Diary written");

    if descriptor.context.distributed {
        let Some(username) = username else {
            error!("Distributed run but no username to ship the diary with");
            return Err(NodeExit::ClientTransfer);
        };
        if let Err(source) = ship_diary(username, &descriptor_master_host(link), &artifact).await {
            error!(%source, "Couldn't ship diary upstream");
            return Err(NodeExit::ClientTransfer);
        }
        info!("Diary shipped upstream");
    }

    Ok(())
}

/// The master's address, recovered from the control connection.
fn descriptor_master_host(link: &MasterLink) -> String {
    link.peer_host().unwrap_or_else(|| "localhost".to_string())
}

/// Execute the schedule until the deadline, recording every action.
///
/// The schedule cycles: when the last action finishes before the run
/// length has elapsed, execution wraps around to the first. An empty
/// schedule just sleeps the run out.
pub(crate) async fn execute_workload(
    engine: &mut dyn PubSubEngine,
    schedule: &[PsAction],
    run_length: Duration,
    diary: &SharedDiary,
    epoch: Instant,
) -> Result<(), super::engine::EngineError> {
    let deadline = Instant::now() + run_length;

    if schedule.is_empty() {
        sleep(run_length).await;
        return Ok(());
    }

    'run: loop {
        for action in schedule {
            let now = Instant::now();
            if now >= deadline {
                break 'run;
            }
            sleep(action.delay().min(deadline - now)).await;
            if Instant::now() >= deadline {
                break 'run;
            }

            let started_ns = epoch.elapsed().as_nanos() as u64;
            let payload_size = action.payload_size.unwrap_or(0);
            let message_id = match action.kind {
                ActionKind::Advertise => engine.advertise(&action.topic).await.map(|_| None)?,
                ActionKind::Unadvertise => engine.unadvertise(&action.topic).await.map(|_| None)?,
                ActionKind::Publish => engine.publish(&action.topic, payload_size).await.map(Some)?,
                ActionKind::Subscribe => engine.subscribe(&action.topic).await.map(|_| None)?,
                ActionKind::Unsubscribe => engine.unsubscribe(&action.topic).await.map(|_| None)?,
                // Receives are recorded by the delivery listener, never scheduled
                ActionKind::Receive => None,
            };
            let ended_ns = epoch.elapsed().as_nanos() as u64;

            diary.append(DiaryRecord {
                kind: action.kind,
                topic: action.topic.clone(),
                payload_size: action.payload_size,
                occurred_at: Utc::now(),
                started_ns,
                ended_ns,
                message_id,
            });
        }
    }

    Ok(())
}

/// Hand the artifact to the external transfer mechanism.
async fn ship_diary(username: &str, master_host: &str, artifact: &Path) -> std::io::Result<()> {
    let status = tokio::process::Command::new("scp")
        .arg(artifact)
        .arg(format!("{}@{}:", username, master_host))
        .status()
        .await?;
    if !status.success() {
        return Err(std::io::Error::other(format!("scp exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::LoopbackEngine;
    use crate::descriptor::{EngineKind, NetworkProtocol, RunContext};

    fn client_descriptor(attached: Vec<String>, workload: Vec<PsAction>) -> NodeDescriptor {
        NodeDescriptor {
            name: "c1".to_string(),
            role: NodeRole::Client,
            engine: EngineKind::Loopback,
            protocol: NetworkProtocol::Tcp,
            host: "127.0.0.1".to_string(),
            port: 0,
            neighbour_uris: vec![],
            attached_uris: attached,
            workload,
            context: RunContext {
                topology: "t".to_string(),
                distributed: false,
                run_length_secs: 1,
                run_number: 1,
            },
        }
    }

    fn action(kind: ActionKind, topic: &str, delay_ms: u64) -> PsAction {
        PsAction {
            kind,
            topic: topic.to_string(),
            delay_ms,
            payload_size: if kind == ActionKind::Publish { Some(32) } else { None },
        }
    }

    /// Start a loopback broker on an ephemeral port and return its URI.
    async fn live_broker() -> (LoopbackEngine, String) {
        let mut broker = LoopbackEngine::new();
        let mut desc = client_descriptor(vec![], vec![]);
        desc.role = NodeRole::Broker;
        broker.create_broker(&desc).await.unwrap();
        broker.start_broker().await.unwrap();
        let port = broker.bound_port().unwrap();
        (broker, format!("tcp://127.0.0.1:{port}"))
    }

    #[tokio::test]
    async fn test_workload_records_actions_in_order() {
        let (_broker, uri) = live_broker().await;
        let descriptor = client_descriptor(vec![uri], vec![]);

        let mut engine = LoopbackEngine::new();
        engine.init_client(&descriptor, Arc::new(|_| {})).await.unwrap();

        let schedule = vec![
            action(ActionKind::Advertise, "weather", 0),
            action(ActionKind::Publish, "weather", 0),
            action(ActionKind::Unadvertise, "weather", 0),
        ];
        let diary = SharedDiary::new("ctx");
        // A deadline long enough for exactly the first pass to matter, but
        // the cycle repeats; just check order of the first three
        execute_workload(
            &mut engine,
            &schedule,
            Duration::from_millis(150),
            &diary,
            Instant::now(),
        )
        .await
        .unwrap();

        let records = diary.take().records;
        assert!(records.len() >= 3);
        assert_eq!(records[0].kind, ActionKind::Advertise);
        assert_eq!(records[1].kind, ActionKind::Publish);
        assert_eq!(records[1].message_id.as_deref(), Some("loopback-1"));
        assert_eq!(records[2].kind, ActionKind::Unadvertise);
        assert!(records[0].started_ns <= records[1].started_ns);
    }

    #[tokio::test]
    async fn test_workload_stops_at_deadline() {
        let (_broker, uri) = live_broker().await;
        let descriptor = client_descriptor(vec![uri], vec![]);

        let mut engine = LoopbackEngine::new();
        engine.init_client(&descriptor, Arc::new(|_| {})).await.unwrap();

        // Each cycle takes ~40ms; a 100ms run must not execute forever
        let schedule = vec![action(ActionKind::Advertise, "a", 20), action(ActionKind::Unadvertise, "a", 20)];
        let diary = SharedDiary::new("ctx");

        let started = Instant::now();
        execute_workload(
            &mut engine,
            &schedule,
            Duration::from_millis(100),
            &diary,
            Instant::now(),
        )
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!diary.is_empty());
    }

    #[tokio::test]
    async fn test_empty_schedule_sleeps_run_out() {
        let mut engine = LoopbackEngine::new();
        let diary = SharedDiary::new("ctx");

        let started = Instant::now();
        execute_workload(&mut engine, &[], Duration::from_millis(50), &diary, Instant::now())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(diary.is_empty());
    }

    #[tokio::test]
    async fn test_deliveries_land_in_diary() {
        let (_broker, uri) = live_broker().await;
        let descriptor = client_descriptor(vec![uri], vec![]);

        let mut engine = LoopbackEngine::new();
        let diary = SharedDiary::new("ctx");
        let epoch = Instant::now();
        let listener = {
            let diary = diary.clone();
            Arc::new(move |delivery: Delivery| {
                let now_ns = epoch.elapsed().as_nanos() as u64;
                diary.append(DiaryRecord {
                    kind: ActionKind::Receive,
                    topic: delivery.topic,
                    payload_size: Some(delivery.payload_size),
                    occurred_at: Utc::now(),
                    started_ns: now_ns,
                    ended_ns: now_ns,
                    message_id: Some(delivery.message_id),
                });
            })
        };
        engine.init_client(&descriptor, listener).await.unwrap();

        let schedule = vec![
            action(ActionKind::Subscribe, "weather", 0),
            action(ActionKind::Advertise, "weather", 0),
            action(ActionKind::Publish, "weather", 0),
        ];
        execute_workload(&mut engine, &schedule, Duration::from_millis(100), &diary, epoch)
            .await
            .unwrap();

        let records = diary.take().records;
        let receives: Vec<_> = records.iter().filter(|r| r.kind == ActionKind::Receive).collect();
        assert!(!receives.is_empty());
        assert_eq!(receives[0].topic, "weather");
        assert_eq!(receives[0].payload_size, Some(32));
    }

    #[tokio::test]
    async fn test_workload_engine_error_propagates() {
        let (_broker, uri) = live_broker().await;
        let descriptor = client_descriptor(vec![uri], vec![]);

        let mut engine = LoopbackEngine::new();
        engine.init_client(&descriptor, Arc::new(|_| {})).await.unwrap();

        // Publishing without advertising is an engine error
        let schedule = vec![action(ActionKind::Publish, "weather", 0)];
        let diary = SharedDiary::new("ctx");
        let result = execute_workload(
            &mut engine,
            &schedule,
            Duration::from_millis(200),
            &diary,
            Instant::now(),
        )
        .await;
        assert!(result.is_err());
    }
}
