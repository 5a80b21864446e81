//! API DTOs for the control-plane surface.
//!
//! Instants serialize as ISO-8601 UTC strings and durations as
//! floating-point seconds.

use chrono::{DateTime, Utc};
use maestro_runtime::{
    ApprovalRequest, EntityCounts, InfoKey, InfoRequest, LogEntry, LogStream, Project,
    ProjectQuota, Promotion, QueueEntry, Run, RunStep, StepStatus, TickSummary, WorkItem,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub meta: ApiMeta,
    pub request_id: String,
    pub data: T,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiMeta {
    pub status: &'static str,
    pub api_version: &'static str,
}

impl ApiMeta {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            api_version: "v1",
        }
    }
}

pub fn envelope<T>(request_id: String, data: T) -> axum::Json<ApiEnvelope<T>> {
    axum::Json(ApiEnvelope {
        meta: ApiMeta::ok(),
        request_id,
        data,
    })
}

fn iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339()
}

// ── projects ──

#[derive(Clone, Debug, Deserialize)]
pub struct ProjectCreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub quota: Option<QuotaBody>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct QuotaBody {
    pub window_seconds: i64,
    pub max_runs: i64,
}

impl From<QuotaBody> for ProjectQuota {
    fn from(body: QuotaBody) -> Self {
        Self {
            window_seconds: body.window_seconds,
            max_runs: body.max_runs,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProjectOut {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub quota_window_seconds: i64,
    pub quota_max_runs: i64,
}

impl ProjectOut {
    pub fn from_project(project: Project) -> Self {
        Self {
            id: project.id,
            name: project.name,
            description: project.description,
            quota_window_seconds: project.quota.window_seconds,
            quota_max_runs: project.quota.max_runs,
        }
    }
}

// ── work items ──

#[derive(Clone, Debug, Deserialize)]
pub struct WorkItemCreateRequest {
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PolicyUpdateRequest {
    pub max_retries: Option<u32>,
    pub backoff_base_seconds: Option<i64>,
    pub backoff_jitter_seconds: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ToolRecipeRequest {
    pub recipe: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkItemOut {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub tool_recipe: Option<Value>,
    pub max_retries: Option<u32>,
    pub backoff_base_seconds: Option<i64>,
    pub backoff_jitter_seconds: Option<i64>,
}

impl WorkItemOut {
    pub fn from_work_item(work_item: WorkItem) -> Self {
        Self {
            id: work_item.id,
            project_id: work_item.project_id,
            title: work_item.title,
            description: work_item.description,
            tool_recipe: work_item.tool_recipe,
            max_retries: work_item.policy.max_retries,
            backoff_base_seconds: work_item.policy.backoff_base_seconds,
            backoff_jitter_seconds: work_item.policy.backoff_jitter_seconds,
        }
    }
}

// ── approvals ──

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApprovalCreateRequest {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApprovalOut {
    pub id: i64,
    pub work_item_id: i64,
    pub state: String,
    pub reason: Option<String>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

impl ApprovalOut {
    pub fn from_approval(approval: ApprovalRequest) -> Self {
        Self {
            id: approval.id,
            work_item_id: approval.work_item_id,
            state: approval.state.as_str().to_string(),
            reason: approval.reason,
            created_at: iso(approval.created_at),
            decided_at: approval.decided_at.map(iso),
        }
    }
}

// ── runs ──

#[derive(Clone, Debug, Serialize)]
pub struct RunOut {
    pub id: i64,
    pub work_item_id: i64,
    pub state: String,
    pub attempt: u32,
    pub trace_id: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
}

impl RunOut {
    pub fn from_run(run: Run) -> Self {
        let duration_seconds = run.duration_seconds();
        Self {
            id: run.id,
            work_item_id: run.work_item_id,
            state: run.state.as_str().to_string(),
            attempt: run.attempt,
            trace_id: run.trace_id,
            created_at: iso(run.created_at),
            started_at: run.started_at.map(iso),
            finished_at: run.finished_at.map(iso),
            duration_seconds,
            claimed_by: run.claimed_by,
            claim_expires_at: run.claim_expires_at.map(iso),
            last_heartbeat_at: run.last_heartbeat_at.map(iso),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClaimResponse {
    pub granted: bool,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<String>,
    pub run: Option<RunOut>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub claim_expires_at: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CompleteRequest {
    pub agent_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CompleteQuery {
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize)]
pub struct RetryOut {
    pub queue_entry_id: i64,
    pub scheduled_for: String,
    pub next_attempt: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompleteResponse {
    pub run: RunOut,
    pub retry: Option<RetryOut>,
}

// ── steps ──

#[derive(Clone, Debug, Deserialize)]
pub struct StepCreateRequest {
    pub idx: u32,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StepUpdateRequest {
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

impl StepUpdateRequest {
    pub fn parsed_status(&self) -> Result<Option<StepStatus>, String> {
        match &self.status {
            None => Ok(None),
            Some(raw) => StepStatus::parse(raw).map(Some).ok_or_else(|| {
                format!("status must be one of: pending|running|succeeded|failed|skipped, got {raw}")
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepOut {
    pub id: i64,
    pub run_id: i64,
    pub idx: u32,
    pub name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub metadata: Option<Value>,
}

impl StepOut {
    pub fn from_step(step: RunStep) -> Self {
        let duration_seconds = step.duration_seconds();
        Self {
            id: step.id,
            run_id: step.run_id,
            idx: step.idx,
            name: step.name,
            status: step.status.as_str().to_string(),
            started_at: step.started_at.map(iso),
            finished_at: step.finished_at.map(iso),
            duration_seconds,
            metadata: step.metadata,
        }
    }
}

// ── logs ──

#[derive(Clone, Debug, Deserialize)]
pub struct LogAppendRequest {
    pub text: String,
    pub stream: Option<String>,
}

impl LogAppendRequest {
    pub fn parsed_stream(&self) -> Result<LogStream, String> {
        match &self.stream {
            None => Ok(LogStream::Stdout),
            Some(raw) => LogStream::parse(raw)
                .ok_or_else(|| format!("stream must be one of: stdout|stderr|system, got {raw}")),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub format: Option<String>,
    pub q: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntryOut {
    pub seq: i64,
    pub timestamp: String,
    pub stream: String,
    pub text: String,
}

impl LogEntryOut {
    pub fn from_entry(entry: LogEntry) -> Self {
        Self {
            seq: entry.seq,
            timestamp: iso(entry.timestamp),
            stream: entry.stream.as_str().to_string(),
            text: entry.text,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LogListResponse {
    pub total: usize,
    pub returned: usize,
    pub entries: Vec<LogEntryOut>,
}

// ── scheduler ──

#[derive(Clone, Debug, Deserialize)]
pub struct EnqueueRequest {
    pub work_item_id: i64,
    pub depends_on_work_item_id: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub delay_seconds: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RequeueRunRequest {
    pub priority: Option<i64>,
    pub backoff: Option<bool>,
    pub delay_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueEntryOut {
    pub id: i64,
    pub work_item_id: i64,
    pub depends_on_work_item_id: Option<i64>,
    pub priority: i64,
    pub scheduled_for: String,
    pub enqueued_at: String,
    pub state: String,
}

impl QueueEntryOut {
    pub fn from_entry(entry: QueueEntry) -> Self {
        Self {
            id: entry.id,
            work_item_id: entry.work_item_id,
            depends_on_work_item_id: entry.depends_on_work_item_id,
            priority: entry.priority,
            scheduled_for: iso(entry.scheduled_for),
            enqueued_at: iso(entry.enqueued_at),
            state: entry.state.as_str().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PromotionOut {
    pub queue_entry_id: i64,
    pub work_item_id: i64,
    pub run_id: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TickResponse {
    pub processed: usize,
    pub promoted: Vec<PromotionOut>,
}

impl TickResponse {
    pub fn from_summary(summary: TickSummary) -> Self {
        let promoted = summary
            .promoted
            .into_iter()
            .map(|Promotion { queue_entry_id, work_item_id, run_id }| PromotionOut {
                queue_entry_id,
                work_item_id,
                run_id,
            })
            .collect::<Vec<_>>();
        Self {
            processed: promoted.len(),
            promoted,
        }
    }
}

// ── info requests ──

#[derive(Clone, Debug, Deserialize)]
pub struct InfoKeyBody {
    pub name: String,
    pub label: Option<String>,
}

impl From<InfoKeyBody> for InfoKey {
    fn from(body: InfoKeyBody) -> Self {
        Self {
            name: body.name,
            label: body.label,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct InfoRequestCreateRequest {
    pub agent_id: String,
    pub keys: Vec<InfoKeyBody>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InfoRespondRequest {
    pub values: Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InfoListQuery {
    #[serde(default)]
    pub plaintext: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct InfoRequestOut {
    pub id: i64,
    pub run_id: i64,
    pub state: String,
    pub keys: Vec<InfoKey>,
    /// Present for plaintext-stored answers, or for sealed answers when
    /// the caller supplied the matching key. `redacted` marks sealed
    /// answers that stay hidden.
    pub responses: Option<Value>,
    pub redacted: bool,
    pub created_at: String,
    pub answered_at: Option<String>,
}

impl InfoRequestOut {
    pub fn from_request(request: InfoRequest, responses: Option<Value>, redacted: bool) -> Self {
        Self {
            id: request.id,
            run_id: request.run_id,
            state: request.state.as_str().to_string(),
            keys: request.keys,
            responses,
            redacted,
            created_at: iso(request.created_at),
            answered_at: request.answered_at.map(iso),
        }
    }
}

// ── observability ──

#[derive(Clone, Debug, Serialize)]
pub struct MetricsResponse {
    pub projects: i64,
    pub work_items: i64,
    pub runs: i64,
    pub queued_entries: i64,
    pub pending_approvals: i64,
    pub pending_info_requests: i64,
}

impl MetricsResponse {
    pub fn from_counts(counts: EntityCounts) -> Self {
        Self {
            projects: counts.projects,
            work_items: counts.work_items,
            runs: counts.runs,
            queued_entries: counts.queued_entries,
            pending_approvals: counts.pending_approvals,
            pending_info_requests: counts.pending_info_requests,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TraceOut {
    pub run_id: i64,
    pub work_item_id: i64,
    pub state: String,
    pub trace_id: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl TraceOut {
    pub fn from_run(run: Run) -> Self {
        Self {
            run_id: run.id,
            work_item_id: run.work_item_id,
            state: run.state.as_str().to_string(),
            trace_id: run.trace_id,
            started_at: run.started_at.map(iso),
            finished_at: run.finished_at.map(iso),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageOut {
    pub project_id: i64,
    pub name: String,
    pub window_seconds: i64,
    pub max_runs: i64,
    pub runs_in_window: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunDetailResponse {
    pub run: RunOut,
    pub steps: Vec<StepOut>,
    pub log_count: i64,
}
