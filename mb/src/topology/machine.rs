//! Machines: host names with ordered port pools
//!
//! Local runs synthesize a single machine whose pool starts at
//! [`LOCAL_PORT_BASE`]; distributed runs parse machines from a hosts file.
//!
//! Hosts file format, one machine per line:
//!
//! ```text
//! # host: ports
//! crunch1: 5000-5003,6000
//! crunch2: 7000
//! ```
//!
//! Port ranges are **half-open**: `5000-5003` contributes 5000, 5001 and
//! 5002 but not 5003. Reversed bounds are normalized with a warning, and a
//! `lo-lo` range contributes the single port `lo` with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Host name used for non-distributed runs.
pub const LOCAL_HOST: &str = "localhost";

/// First engine port handed out on a local machine.
pub const LOCAL_PORT_BASE: u16 = 1100;

/// Errors raised while reading a hosts file
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Cannot read hosts file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected `host: ports`")]
    MissingSeparator { line: usize },

    #[error("Line {line}: host name is empty")]
    EmptyHost { line: usize },

    #[error("Line {line}: {token} is not a port")]
    BadPort { line: usize, token: String },

    #[error("Line {line}: port range {token} is malformed")]
    BadRange { line: usize, token: String },

    #[error("Hosts supply {available} port(s) but {needed} are needed")]
    NotEnoughPorts { available: usize, needed: usize },
}

/// A host with its ordered pool of usable engine ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    host: String,
    ports: Vec<u16>,
    cursor: usize,
}

impl Machine {
    /// A synthetic local machine with `count` consecutive ports from
    /// [`LOCAL_PORT_BASE`].
    pub fn local(count: usize) -> Self {
        let ports = (0..count).map(|i| LOCAL_PORT_BASE + i as u16).collect();
        Self {
            host: LOCAL_HOST.to_string(),
            ports,
            cursor: 0,
        }
    }

    pub fn new(host: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            host: host.into(),
            ports,
            cursor: 0,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// The port the cursor currently points at, if the pool isn't spent.
    pub fn active_port(&self) -> Option<u16> {
        self.ports.get(self.cursor).copied()
    }

    /// Consume the active port, moving the cursor forward.
    pub fn take_port(&mut self) -> Option<u16> {
        let port = self.active_port()?;
        self.cursor += 1;
        Some(port)
    }

    pub fn remaining(&self) -> usize {
        self.ports.len().saturating_sub(self.cursor)
    }
}

fn is_ignorable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn parse_port(token: &str, line: usize) -> Result<u16, MachineError> {
    token.trim().parse().map_err(|_| MachineError::BadPort {
        line,
        token: token.trim().to_string(),
    })
}

/// Expand one comma-separated ports segment (`5000-5003,6000`).
fn parse_ports_segment(segment: &str, line: usize) -> Result<Vec<u16>, MachineError> {
    let mut ports = Vec::new();

    for item in segment.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        if let Some((lo_str, hi_str)) = item.split_once('-') {
            if lo_str.trim().is_empty() || hi_str.trim().is_empty() || hi_str.contains('-') {
                return Err(MachineError::BadRange {
                    line,
                    token: item.to_string(),
                });
            }
            let lo = parse_port(lo_str, line)?;
            let hi = parse_port(hi_str, line)?;

            if lo == hi {
                warn!(line, range = item, "Range contains a single port");
                ports.push(lo);
            } else {
                let (lo, hi) = if lo > hi {
                    warn!(line, range = item, "Range bounds reversed, normalizing");
                    (hi, lo)
                } else {
                    (lo, hi)
                };
                // Half-open: the upper bound is excluded
                ports.extend(lo..hi);
            }
        } else {
            ports.push(parse_port(item, line)?);
        }
    }

    Ok(ports)
}

/// Parse hosts text into machines, requiring at least `needed` ports total.
///
/// On any error the machine list is discarded; a partial pool is never used.
pub fn parse_hosts_text(content: &str, needed: usize) -> Result<Vec<Machine>, MachineError> {
    let mut machines = Vec::new();
    let mut available = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        if is_ignorable(raw) {
            continue;
        }

        let Some((host, ports_segment)) = raw.split_once(':') else {
            return Err(MachineError::MissingSeparator { line });
        };
        let host = host.trim();
        if host.is_empty() {
            return Err(MachineError::EmptyHost { line });
        }

        let ports = parse_ports_segment(ports_segment, line)?;
        available += ports.len();
        machines.push(Machine::new(host, ports));
    }

    if available < needed {
        return Err(MachineError::NotEnoughPorts { available, needed });
    }

    Ok(machines)
}

/// Parse a hosts file. See [`parse_hosts_text`].
pub fn parse_hosts_file(path: &Path, needed: usize) -> Result<Vec<Machine>, MachineError> {
    let content = fs::read_to_string(path).map_err(|source| MachineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_hosts_text(&content, needed)
}
