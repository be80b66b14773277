use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TaskId;
use crate::status::TaskStatus;

/// Frame field names that task request fields must not shadow.
const RESERVED_KEYS: &[&str] = &[
    "type",
    "task_id",
    "sequence",
    "status",
    "terminal",
    "error",
    "created_at",
    "updated_at",
    "sent_at",
];

/// Sequenced status payload carried by `snapshot` and `update` frames.
/// The task's request fields are flattened into the frame for display.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub task_id: TaskId,
    pub sequence: u64,
    pub status: TaskStatus,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
    pub sent_at: String,
}

impl StatusBody {
    /// Build a body from task record fields. `sequence` 0 means no prior
    /// broadcast has been observed for this task.
    pub fn new(
        task_id: TaskId,
        sequence: u64,
        status: TaskStatus,
        error: Option<String>,
        request: &Value,
        created_at: String,
        updated_at: String,
    ) -> Self {
        Self {
            task_id,
            sequence,
            status,
            terminal: status.is_terminal(),
            error,
            fields: display_fields(request),
            created_at,
            updated_at,
            sent_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Wire frame: one JSON object per delivered message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusFrame {
    Snapshot(StatusBody),
    Update(StatusBody),
    Heartbeat { task_id: TaskId, sent_at: String },
}

impl StatusFrame {
    pub fn heartbeat(task_id: TaskId) -> Self {
        Self::Heartbeat {
            task_id,
            sent_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Update(_) => "update",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Snapshot(body) | Self::Update(body) => &body.task_id,
            Self::Heartbeat { task_id, .. } => task_id,
        }
    }

    /// Sequence number, if this frame participates in ordering.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Snapshot(body) | Self::Update(body) => Some(body.sequence),
            Self::Heartbeat { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Snapshot(body) | Self::Update(body) => body.terminal,
            Self::Heartbeat { .. } => false,
        }
    }
}

/// Copy of the task's request payload suitable for inlining into a frame.
/// Non-object payloads are kept under a `request` key; keys that would
/// shadow frame fields are dropped.
fn display_fields(request: &Value) -> serde_json::Map<String, Value> {
    match request {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("request".to_string(), other.clone());
            map
        }
    }
}
