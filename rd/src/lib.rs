//! rundiary - ordered action records for one benchmark run
//!
//! Every client process keeps a diary: one record per pub/sub action it
//! performed (or delivery it received), in the order they happened. The diary
//! is owned by exactly one process for the duration of the run and is only
//! shared with listener callbacks, which append through [`SharedDiary`].
//! At run end the diary is flushed to a context-named `.dia` artifact.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File extension of the serialized diary artifact.
pub const DIARY_EXTENSION: &str = "dia";

/// Errors that can occur persisting or loading a diary
#[derive(Debug, Error)]
pub enum DiaryError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed diary artifact {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The kinds of pub/sub actions a client can record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Advertise,
    Unadvertise,
    Publish,
    Subscribe,
    Unsubscribe,
    /// A message delivered to this client by its broker
    Receive,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advertise => write!(f, "advertise"),
            Self::Unadvertise => write!(f, "unadvertise"),
            Self::Publish => write!(f, "publish"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// One diary page: what happened, when it started, how long it took
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiaryRecord {
    /// What kind of action this record describes
    pub kind: ActionKind,

    /// The topic the action was performed against
    pub topic: String,

    /// Payload size in bytes, for publish/receive records
    #[serde(rename = "payload-size", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,

    /// Wall-clock stamp, for cross-machine correlation only
    #[serde(rename = "occurred-at")]
    pub occurred_at: DateTime<Utc>,

    /// Nanoseconds since the client's run started when the action began
    #[serde(rename = "started-ns")]
    pub started_ns: u64,

    /// Nanoseconds since the client's run started when the action returned
    #[serde(rename = "ended-ns")]
    pub ended_ns: u64,

    /// Identifier the engine assigned to the message, if any
    #[serde(rename = "message-id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl DiaryRecord {
    /// How long the engine took to handle the action.
    pub fn action_delay_ns(&self) -> u64 {
        self.ended_ns.saturating_sub(self.started_ns)
    }
}

/// The ordered diary of one client's run
///
/// Version field exists so a future layout change can still read old
/// artifacts; bump it when `DiaryRecord` changes shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diary {
    pub version: u8,

    /// The run-context string this diary belongs to, also its artifact stem
    pub context: String,

    pub records: Vec<DiaryRecord>,
}

pub const DIARY_FORMAT_VERSION: u8 = 1;

impl Diary {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            version: DIARY_FORMAT_VERSION,
            context: context.into(),
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, record: DiaryRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The artifact file name for this diary: `<context>.dia`
    pub fn artifact_name(&self) -> String {
        format!("{}.{}", self.context, DIARY_EXTENSION)
    }

    /// Write this diary as a `.dia` artifact under `dir`, returning the path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, DiaryError> {
        let path = dir.join(self.artifact_name());
        let file = fs::File::create(&path).map_err(|source| DiaryError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|source| DiaryError::Malformed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Read a diary artifact back.
    pub fn load(path: &Path) -> Result<Self, DiaryError> {
        let file = fs::File::open(path).map_err(|source| DiaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| DiaryError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A diary shared with engine delivery callbacks
///
/// The mutex is held only for the duration of a single append; callers must
/// not hold it across any await point or engine call.
#[derive(Debug, Clone)]
pub struct SharedDiary {
    inner: Arc<Mutex<Diary>>,
}

impl SharedDiary {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Diary::new(context))),
        }
    }

    pub fn append(&self, record: DiaryRecord) {
        let mut diary = self.inner.lock().expect("diary lock poisoned");
        diary.append(record);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("diary lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the diary out of the shared wrapper for persistence.
    ///
    /// Ownership transfers to the caller; the shared handle keeps an empty
    /// diary with the same context afterwards.
    pub fn take(&self) -> Diary {
        let mut diary = self.inner.lock().expect("diary lock poisoned");
        let context = diary.context.clone();
        std::mem::replace(&mut diary, Diary::new(context))
    }
}
