//! Topology file parsing
//!
//! Line-oriented: `name role connections [workload]`, whitespace-separated,
//! connections comma-separated, `#` comments and blank lines ignored.
//! Roles: `B` (broker), `P` (publisher), `S` (subscriber). A name that
//! appears with both `P` and `S` lines becomes a single client.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::logical::LogicalTopology;

/// Errors raised while reading a topology file
#[derive(Debug, Error)]
pub enum TopologyParseError {
    #[error("Cannot read topology file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected `name role connections [workload]`, got {got} fields")]
    FieldCount { line: usize, got: usize },

    #[error("Line {line}: unknown role {role}")]
    UnknownRole { line: usize, role: String },

    #[error("Line {line}: client {name} needs a workload")]
    MissingWorkload { line: usize, name: String },

    #[error("Line {line}: node {name} declared twice with conflicting roles")]
    ConflictingRoles { line: usize, name: String },
}

fn is_ignorable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn split_connections(segment: &str) -> Vec<String> {
    segment
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse topology text into a [`LogicalTopology`].
pub fn parse_topology(content: &str) -> Result<LogicalTopology, TopologyParseError> {
    let mut topo = LogicalTopology::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        if is_ignorable(raw) {
            continue;
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(TopologyParseError::FieldCount {
                line,
                got: fields.len(),
            });
        }

        let name = fields[0];
        let role = fields[1];
        let connections = split_connections(fields[2]);

        match role.to_uppercase().as_str() {
            "B" => {
                if topo.clients().contains_key(name) {
                    return Err(TopologyParseError::ConflictingRoles {
                        line,
                        name: name.to_string(),
                    });
                }
                topo.add_broker(name, connections);
            }
            "P" | "S" => {
                if topo.brokers().contains_key(name) {
                    return Err(TopologyParseError::ConflictingRoles {
                        line,
                        name: name.to_string(),
                    });
                }
                let workload = fields.get(3).copied().ok_or_else(|| TopologyParseError::MissingWorkload {
                    line,
                    name: name.to_string(),
                })?;
                // A name seen as both P and S stays one client; the last
                // line's attachments and workload win.
                topo.add_client(name, connections, workload);
            }
            other => {
                return Err(TopologyParseError::UnknownRole {
                    line,
                    role: other.to_string(),
                });
            }
        }
    }

    Ok(topo)
}

/// Parse a topology file. See [`parse_topology`].
pub fn parse_topology_file(path: &Path) -> Result<LogicalTopology, TopologyParseError> {
    let content = fs::read_to_string(path).map_err(|source| TopologyParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_topology(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR: &str = "\
# two brokers, one publisher
b1  B  b2
b2  B  b1
c1  P  b1  pubwork
";

    #[test]
    fn test_parse_pair_topology() {
        let topo = parse_topology(PAIR).unwrap();
        assert_eq!(topo.broker_count(), 2);
        assert_eq!(topo.client_count(), 1);
        assert_eq!(topo.brokers()["b1"], vec!["b2".to_string()]);
        assert_eq!(topo.clients()["c1"].workload, "pubwork");
    }

    #[test]
    fn test_parse_multiple_connections() {
        let topo = parse_topology("b1 B b2,b3\nb2 B b1\nb3 B b1\n").unwrap();
        assert_eq!(topo.brokers()["b1"], vec!["b2".to_string(), "b3".to_string()]);
    }

    #[test]
    fn test_client_requires_workload() {
        let err = parse_topology("b1 B b2\nc1 P b1\n").unwrap_err();
        assert!(matches!(err, TopologyParseError::MissingWorkload { line: 2, .. }));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let err = parse_topology("n1 X n2\n").unwrap_err();
        assert!(matches!(err, TopologyParseError::UnknownRole { .. }));
    }

    #[test]
    fn test_conflicting_roles_rejected() {
        let err = parse_topology("n1 B n2\nn1 P n2 w\n").unwrap_err();
        assert!(matches!(err, TopologyParseError::ConflictingRoles { line: 2, .. }));
    }

    #[test]
    fn test_pub_and_sub_merge_into_one_client() {
        let topo = parse_topology("b1 B b2\nc1 P b1 pubwork\nc1 S b1 subwork\n").unwrap();
        assert_eq!(topo.client_count(), 1);
        assert_eq!(topo.clients()["c1"].workload, "subwork");
    }
}
