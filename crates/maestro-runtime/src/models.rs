//! Control-plane domain entities.
//!
//! Everything is stored flat and referenced by integer id; status enums
//! carry `as_str`/`parse` pairs so the store can persist them as text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryState {
    Queued,
    Consumed,
}

impl QueueEntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Consumed => "consumed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "consumed" => Self::Consumed,
            _ => Self::Queued,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InfoRequestState {
    Pending,
    Answered,
    Cancelled,
}

impl InfoRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "answered" => Self::Answered,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Which output stream a log line belongs to. `System` lines are written
/// by the control plane itself (e.g. lease reclaim notices).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Per-project run-admission quota. `max_runs == 0` means unlimited.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectQuota {
    pub window_seconds: i64,
    pub max_runs: i64,
}

impl Default for ProjectQuota {
    fn default() -> Self {
        Self {
            window_seconds: 86_400,
            max_runs: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub quota: ProjectQuota,
}

/// Per-work-item retry overrides; `None` falls back to process defaults.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WorkItemPolicy {
    pub max_retries: Option<u32>,
    pub backoff_base_seconds: Option<i64>,
    pub backoff_jitter_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    /// Externally validated recipe value; the core stores it opaquely.
    pub tool_recipe: Option<Value>,
    pub policy: WorkItemPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: i64,
    pub work_item_id: i64,
    pub state: ApprovalState,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub work_item_id: i64,
    pub depends_on_work_item_id: Option<i64>,
    pub priority: i64,
    pub scheduled_for: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub state: QueueEntryState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub work_item_id: i64,
    pub state: RunState,
    pub attempt: u32,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Terminal duration in seconds, when both endpoints are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStep {
    pub id: i64,
    pub run_id: i64,
    pub idx: u32,
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

impl RunStep {
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: i64,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

/// One required input declared by an info request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfoKey {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// How an info-request response is held at rest. The core never picks
/// the cipher; sealed blobs carry whatever algorithm tag the edge used.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoredResponse {
    Plain(String),
    Sealed { algo: String, blob: Vec<u8> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoRequest {
    pub id: i64,
    pub run_id: i64,
    pub keys: Vec<InfoKey>,
    pub state: InfoRequestState,
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

/// Advisory agent identity; rows appear on first claim or heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub last_seen_at: DateTime<Utc>,
}
