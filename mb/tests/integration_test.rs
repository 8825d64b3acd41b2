//! End-to-end tests for meshbench
//!
//! These drive the real `mb-node` binary through the full orchestration:
//! realize -> launch -> rendezvous -> barriers -> timed run -> teardown.

use std::collections::HashMap;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use meshbench::config::{Config, ControlConfig, LaunchConfig, MonitorConfig};
use meshbench::descriptor::{EngineKind, NetworkProtocol};
use meshbench::orchestrator::{BenchmarkPlan, Orchestrator};
use meshbench::topology::{LogicalTopology, Machine};
use meshbench::workload::{PsAction, parse_workload};

use rundiary::{ActionKind, Diary};

/// The compiled node agent, courtesy of cargo.
const NODE_EXE: &str = env!("CARGO_BIN_EXE_mb-node");

fn test_config(work_dir: &TempDir) -> Config {
    Config {
        control: ControlConfig {
            // Ephemeral control port so parallel tests never collide
            port: 0,
            ..Default::default()
        },
        launch: LaunchConfig {
            node_exe: NODE_EXE.to_string(),
            work_dir: Some(work_dir.path().to_path_buf()),
            ..Default::default()
        },
        monitor: MonitorConfig {
            // Keep test teardown short
            cooldown_per_broker_ms: 50,
            ..Default::default()
        },
    }
}

fn pair_topology() -> LogicalTopology {
    let mut topology = LogicalTopology::new();
    topology.add_broker("b1", vec!["b2".to_string()]);
    topology.add_broker("b2", vec!["b1".to_string()]);
    topology.add_client("c1", vec!["b1".to_string()], "pubwork");
    topology
}

fn publish_workload() -> HashMap<String, Vec<PsAction>> {
    let schedule = parse_workload(
        "\
advertise   weather 0
subscribe   weather 0
publish     weather 100 64
",
    )
    .unwrap();
    HashMap::from([("pubwork".to_string(), schedule)])
}

fn plan(topology: LogicalTopology, workloads: HashMap<String, Vec<PsAction>>, runs: u32) -> BenchmarkPlan {
    let brokers = topology.broker_count();
    BenchmarkPlan {
        topology_name: "pair".to_string(),
        topology,
        protocol: NetworkProtocol::Tcp,
        engine: EngineKind::Loopback,
        distributed: false,
        machines: vec![Machine::local(brokers)],
        workloads,
        username: None,
        run_lengths: vec![Duration::from_secs(2)],
        runs_per_length: runs,
    }
}

// =============================================================================
// Full benchmark scenarios
// =============================================================================

#[tokio::test]
#[serial]
async fn test_end_to_end_pair_topology() {
    let work_dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(test_config(&work_dir));

    let report = orchestrator
        .run_benchmark(plan(pair_topology(), publish_workload(), 1))
        .await
        .expect("benchmark setup must succeed");

    assert!(report.all_successful(), "runs: {:?}", report.runs);
    assert_eq!(report.runs.len(), 1);
    assert_eq!(report.runs[0].label, "pair_L_tcp_2s_r1");

    // The client left its diary behind, named by its run context
    let artifact = work_dir.path().join("pair_L_tcp_2s_r1_c1.dia");
    assert!(artifact.exists(), "diary artifact missing");

    let diary = Diary::load(&artifact).unwrap();
    assert_eq!(diary.context, "pair_L_tcp_2s_r1_c1");
    assert!(!diary.is_empty());

    // The schedule advertises, subscribes, then publishes; the loopback
    // engine echoes the publishes back as receives
    let kinds: Vec<ActionKind> = diary.records.iter().map(|r| r.kind).collect();
    assert_eq!(kinds[0], ActionKind::Advertise);
    assert_eq!(kinds[1], ActionKind::Subscribe);
    assert!(kinds.contains(&ActionKind::Publish));
    assert!(kinds.contains(&ActionKind::Receive));

    // Scheduled actions never go backwards in time; receives interleave
    // wherever the engine delivered them
    let scheduled: Vec<_> = diary
        .records
        .iter()
        .filter(|r| r.kind != ActionKind::Receive)
        .collect();
    for window in scheduled.windows(2) {
        assert!(window[0].started_ns <= window[1].started_ns);
    }
}

#[tokio::test]
#[serial]
async fn test_consecutive_runs_reuse_ports() {
    let work_dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(test_config(&work_dir));

    // Two run indices: the second rebinds the same broker ports after the
    // kill and cooldown of the first
    let report = orchestrator
        .run_benchmark(plan(pair_topology(), publish_workload(), 2))
        .await
        .unwrap();

    assert!(report.all_successful(), "runs: {:?}", report.runs);
    assert_eq!(report.runs.len(), 2);
    assert!(work_dir.path().join("pair_L_tcp_2s_r1_c1.dia").exists());
    assert!(work_dir.path().join("pair_L_tcp_2s_r2_c1.dia").exists());
}

#[tokio::test]
#[serial]
async fn test_failing_client_fails_the_run() {
    let work_dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(test_config(&work_dir));

    // Publishing an unadvertised topic is an engine error: the client
    // exits with its workload-failure code and the monitor aborts the run
    let broken = parse_workload("publish weather 100 64\n").unwrap();
    let workloads = HashMap::from([("pubwork".to_string(), broken)]);

    let report = orchestrator
        .run_benchmark(plan(pair_topology(), workloads, 1))
        .await
        .unwrap();

    assert!(!report.all_successful());
    assert_eq!(report.runs.len(), 1);
    assert!(report.runs[0].detail.contains("workload"), "detail: {}", report.runs[0].detail);
}

#[tokio::test]
#[serial]
async fn test_larger_mesh_synchronizes() {
    // A 3-broker line with two clients on opposite ends
    let mut topology = LogicalTopology::new();
    topology.add_broker("b1", vec!["b2".to_string()]);
    topology.add_broker("b2", vec!["b1".to_string(), "b3".to_string()]);
    topology.add_broker("b3", vec!["b2".to_string()]);
    topology.add_client("c1", vec!["b1".to_string()], "pubwork");
    topology.add_client("c2", vec!["b3".to_string()], "pubwork");

    let work_dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(test_config(&work_dir));

    let report = orchestrator
        .run_benchmark(plan(topology, publish_workload(), 1))
        .await
        .unwrap();

    assert!(report.all_successful(), "runs: {:?}", report.runs);
    assert!(work_dir.path().join("pair_L_tcp_2s_r1_c1.dia").exists());
    assert!(work_dir.path().join("pair_L_tcp_2s_r1_c2.dia").exists());
}

// =============================================================================
// Node binary argument contract
// =============================================================================

mod node_binary {
    use assert_cmd::Command;

    #[test]
    fn test_no_arguments_exits_usage() {
        Command::new(super::NODE_EXE).assert().code(10);
    }

    #[test]
    fn test_unknown_role_exits_usage() {
        Command::new(super::NODE_EXE)
            .args(["b1", "ctx", "localhost", "4444", "loopback", "gateway"])
            .assert()
            .code(10);
    }

    #[test]
    fn test_bad_port_exits_broker_args() {
        Command::new(super::NODE_EXE)
            .args(["b1", "ctx", "localhost", "not-a-port", "loopback", "broker"])
            .assert()
            .code(11);
    }

    #[test]
    fn test_bad_engine_exits_client_args() {
        Command::new(super::NODE_EXE)
            .args(["c1", "ctx", "localhost", "4444", "smoke-signals", "client"])
            .assert()
            .code(21);
    }

    #[test]
    fn test_unreachable_master_exits_socket_code() {
        // Port 1 on loopback refuses immediately; no server ever runs there
        Command::new(super::NODE_EXE)
            .args(["b1", "ctx", "127.0.0.1", "1", "loopback", "broker"])
            .assert()
            .code(12);

        Command::new(super::NODE_EXE)
            .args(["c1", "ctx", "127.0.0.1", "1", "loopback", "client"])
            .assert()
            .code(22);
    }
}
