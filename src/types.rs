//! Data structures exchanged between node workers and the orchestrator.
//!
//! A worker only ever sends two message shapes over its channel: a fault
//! notification or a container change record.  Both serialise untagged so
//! the wire form stays `{"node","error"}` and
//! `{"node","name","event","labels","start"}` respectively.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw container labels, ordered by key.
pub type Labels = BTreeMap<String, String>;

/// What caused a container to be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Restart,
    /// Found running by a full sweep.
    Poll,
    Die,
    Kill,
    Stop,
    Destroy,
}

impl EventKind {
    /// Map a runtime event status onto a kind.  Unknown statuses yield
    /// `None` and are never emitted.
    pub fn from_status(status: &str) -> Option<Self> {
        let kind = match status.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "restart" => Self::Restart,
            "poll" => Self::Poll,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "stop" => Self::Stop,
            "destroy" => Self::Destroy,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether the container is running as of this event.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Start | Self::Restart | Self::Poll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Poll => "poll",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit passed from a worker to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerChangeRecord {
    pub node: String,
    pub name: String,
    pub event: EventKind,
    pub labels: Labels,
    /// `true` while the container is running.
    pub start: bool,
}

impl ContainerChangeRecord {
    pub fn new(node: impl Into<String>, name: impl Into<String>, event: EventKind, labels: Labels) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
            event,
            labels,
            start: event.is_active(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.start
    }
}

/// Everything a worker can tell the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    /// A non-fatal error inside the worker.
    Fault { node: String, error: String },
    Change(ContainerChangeRecord),
}

impl WorkerMessage {
    pub fn fault(node: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::Fault {
            node: node.into(),
            error: error.to_string(),
        }
    }
}

/// Lifecycle of the worker bound to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Disconnected,
    Respawning,
    Terminated,
}

impl WorkerState {
    /// States in which the supervisor should replace the worker.
    pub fn needs_respawn(self) -> bool {
        matches!(self, Self::Disconnected | Self::Terminated)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
            Self::Respawning => "respawning",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
