//! Client workload schedules
//!
//! A workload is an ordered list of pub/sub actions with inter-action
//! delays. Clients cycle through their schedule until the run deadline.
//! The file format is line-oriented: `kind topic delay-ms [payload-bytes]`,
//! `#` comments and blank lines ignored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rundiary::ActionKind;

/// Errors raised while reading a workload file
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Cannot read workload file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected `kind topic delay-ms [payload-bytes]`, got {got} fields")]
    FieldCount { line: usize, got: usize },

    #[error("Line {line}: unknown action kind {kind}")]
    UnknownKind { line: usize, kind: String },

    #[error("Line {line}: {field} is not a number")]
    NotANumber { line: usize, field: &'static str },

    #[error("Line {line}: {kind} is not a schedulable action")]
    NotSchedulable { line: usize, kind: ActionKind },
}

/// One scheduled pub/sub action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsAction {
    pub kind: ActionKind,

    pub topic: String,

    /// Delay before this action fires, in milliseconds
    #[serde(rename = "delay-ms")]
    pub delay_ms: u64,

    /// Payload size in bytes, for publishes
    #[serde(rename = "payload-size", skip_serializing_if = "Option::is_none", default)]
    pub payload_size: Option<usize>,
}

impl PsAction {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn is_ignorable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn parse_kind(token: &str) -> Option<ActionKind> {
    match token.to_lowercase().as_str() {
        "advertise" | "a" => Some(ActionKind::Advertise),
        "unadvertise" | "v" => Some(ActionKind::Unadvertise),
        "publish" | "p" => Some(ActionKind::Publish),
        "subscribe" | "s" => Some(ActionKind::Subscribe),
        "unsubscribe" | "u" => Some(ActionKind::Unsubscribe),
        "receive" | "r" => Some(ActionKind::Receive),
        _ => None,
    }
}

/// Parse one workload file into an action schedule.
pub fn parse_workload_file(path: &Path) -> Result<Vec<PsAction>, WorkloadError> {
    let content = fs::read_to_string(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_workload(&content)
}

/// Parse workload text. See the module docs for the line format.
pub fn parse_workload(content: &str) -> Result<Vec<PsAction>, WorkloadError> {
    let mut schedule = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        if is_ignorable(raw) {
            continue;
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(WorkloadError::FieldCount {
                line,
                got: fields.len(),
            });
        }

        let kind = parse_kind(fields[0]).ok_or_else(|| WorkloadError::UnknownKind {
            line,
            kind: fields[0].to_string(),
        })?;
        // Receives happen to a client, never on a schedule
        if kind == ActionKind::Receive {
            return Err(WorkloadError::NotSchedulable { line, kind });
        }

        let delay_ms: u64 = fields[2]
            .parse()
            .map_err(|_| WorkloadError::NotANumber { line, field: "delay-ms" })?;

        let payload_size = match fields.get(3) {
            Some(token) => Some(token.parse().map_err(|_| WorkloadError::NotANumber {
                line,
                field: "payload-bytes",
            })?),
            None => None,
        };

        schedule.push(PsAction {
            kind,
            topic: fields[1].to_string(),
            delay_ms,
            payload_size,
        });
    }

    Ok(schedule)
}

/// Load a set of named workload files into a workload map for the realizer.
pub fn load_workloads(paths: &[PathBuf]) -> Result<HashMap<String, Vec<PsAction>>, WorkloadError> {
    let mut map = HashMap::new();
    for path in paths {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        map.insert(stem, parse_workload_file(path)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_schedule() {
        let text = "\
# simple publisher
advertise  weather  0
publish    weather  250  64
publish    weather  250  64
unadvertise weather 100
";
        let schedule = parse_workload(text).unwrap();
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule[0].kind, ActionKind::Advertise);
        assert_eq!(schedule[1].payload_size, Some(64));
        assert_eq!(schedule[1].delay(), Duration::from_millis(250));
        assert_eq!(schedule[3].kind, ActionKind::Unadvertise);
    }

    #[test]
    fn test_parse_short_kinds() {
        let schedule = parse_workload("s weather 0\nu weather 500\n").unwrap();
        assert_eq!(schedule[0].kind, ActionKind::Subscribe);
        assert_eq!(schedule[1].kind, ActionKind::Unsubscribe);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = parse_workload("ping weather 0\n").unwrap_err();
        assert!(matches!(err, WorkloadError::UnknownKind { line: 1, .. }));
    }

    #[test]
    fn test_receive_not_schedulable() {
        let err = parse_workload("receive weather 0\n").unwrap_err();
        assert!(matches!(err, WorkloadError::NotSchedulable { .. }));
    }

    #[test]
    fn test_bad_delay_rejected() {
        let err = parse_workload("publish weather soon 64\n").unwrap_err();
        assert!(matches!(err, WorkloadError::NotANumber { field: "delay-ms", .. }));
    }

    #[test]
    fn test_field_count_enforced() {
        assert!(matches!(
            parse_workload("publish weather\n").unwrap_err(),
            WorkloadError::FieldCount { got: 2, .. }
        ));
        assert!(matches!(
            parse_workload("publish weather 0 64 extra\n").unwrap_err(),
            WorkloadError::FieldCount { got: 5, .. }
        ));
    }
}
