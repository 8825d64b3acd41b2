//! meshbench configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main meshbench configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination-server settings
    pub control: ControlConfig,

    /// Process launching settings
    pub launch: LaunchConfig,

    /// Run monitoring settings
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .meshbench.yml
        let local_config = PathBuf::from(".meshbench.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/meshbench/meshbench.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("meshbench").join("meshbench.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Coordination-server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Port the coordination server listens on
    pub port: u16,

    /// Address spawned nodes dial back to. The loopback default works for
    /// local runs; distributed runs must set the orchestrator machine's
    /// reachable address here.
    #[serde(rename = "advertise-host")]
    pub advertise_host: String,

    /// Optional bound on each handshake phase, in milliseconds.
    ///
    /// The default is no timeout, matching the behavior this system was
    /// measured against: a node that dies without a word stalls its peers
    /// until the orchestrator gives up on the run.
    #[serde(rename = "phase-timeout-ms")]
    pub phase_timeout_ms: Option<u64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: 4444,
            advertise_host: "127.0.0.1".to_string(),
            phase_timeout_ms: None,
        }
    }
}

impl ControlConfig {
    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }
}

/// Process launching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Node agent executable, local path or remote command name
    #[serde(rename = "node-exe")]
    pub node_exe: String,

    /// Remote shell used for distributed launches
    #[serde(rename = "remote-shell")]
    pub remote_shell: String,

    /// Working directory for locally launched nodes; diary artifacts land
    /// here. Nodes inherit the orchestrator's directory when unset.
    #[serde(rename = "work-dir")]
    pub work_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            node_exe: "mb-node".to_string(),
            remote_shell: "ssh".to_string(),
            work_dir: None,
        }
    }
}

/// Run monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Liveness is polled every run-length / poll-divisor
    #[serde(rename = "poll-divisor")]
    pub poll_divisor: u32,

    /// Lower bound on the poll interval, in milliseconds
    #[serde(rename = "min-poll-ms")]
    pub min_poll_ms: u64,

    /// Post-kill cooldown per broker, in milliseconds; brokers need time to
    /// release their bound ports before the next run reuses them
    #[serde(rename = "cooldown-per-broker-ms")]
    pub cooldown_per_broker_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_divisor: 10,
            min_poll_ms: 100,
            cooldown_per_broker_ms: 1_000,
        }
    }
}

impl MonitorConfig {
    /// The poll interval for a run of the given length.
    pub fn poll_interval(&self, run_length: Duration) -> Duration {
        let divided = run_length / self.poll_divisor.max(1);
        divided.max(Duration::from_millis(self.min_poll_ms))
    }

    /// The cooldown after killing `brokers` broker processes.
    pub fn cooldown(&self, brokers: usize) -> Duration {
        Duration::from_millis(self.cooldown_per_broker_ms) * brokers as u32
    }
}
