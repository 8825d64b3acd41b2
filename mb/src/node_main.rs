//! mb-node: the bootstrap agent spawned once per broker/client process
//!
//! Positional argument contract: name, context, master host, master port,
//! engine, role, and a username only for distributed runs. Argument
//! failures exit with their dedicated code before any network activity.

use std::path::PathBuf;

use meshbench::agent::{self, NodeArgs};
use meshbench::error::NodeExit;

/// Log to a context-named file next to the node's other artifacts; the
/// launcher discards stdio, so a file is the only trace a node leaves.
fn setup_logging(context: &str) {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshbench")
        .join("logs");

    if std::fs::create_dir_all(&log_dir).is_err() {
        return;
    }
    let Ok(log_file) = std::fs::File::create(log_dir.join(format!("{context}.log"))) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
        )
        .try_init();
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();

    let args = match NodeArgs::parse(&raw) {
        Ok(args) => args,
        Err(exit) => std::process::exit(exit.code()),
    };

    setup_logging(&args.context);
    tracing::info!(node = %args.name, role = %args.role, "Node process starting");

    let exit = agent::run(args).await;
    if exit != NodeExit::Success {
        std::process::exit(exit.code());
    }
}
