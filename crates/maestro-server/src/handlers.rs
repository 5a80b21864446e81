//! Axum handlers and router for the control-plane API.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use maestro_runtime::{
    ClaimOutcome, HeartbeatOutcome, InfoRequest, ProjectQuota, RuntimeError, StoredResponse,
    WorkItemPolicy,
};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::api_errors::ApiError;
use crate::api_models::{
    envelope, ApiEnvelope, ApprovalCreateRequest, ApprovalOut, ClaimRequest, ClaimResponse,
    CompleteQuery, CompleteRequest, CompleteResponse, EnqueueRequest, HeartbeatRequest,
    HeartbeatResponse, InfoListQuery, InfoRequestCreateRequest, InfoRequestOut, InfoRespondRequest,
    LogAppendRequest, LogEntryOut, LogListResponse, LogsQuery, MetricsResponse,
    PolicyUpdateRequest, ProjectCreateRequest, ProjectOut, QueueEntryOut, QuotaBody,
    RequeueRunRequest, RetryOut, RunDetailResponse, RunOut, StepCreateRequest, StepOut,
    StepUpdateRequest, TickResponse, ToolRecipeRequest, TraceOut, UsageOut, WorkItemCreateRequest,
    WorkItemOut,
};
use crate::middleware::{
    rate_limit_middleware, request_id, request_id_middleware, request_log_middleware,
};
use crate::secrets::{ResponseSealer, SEAL_ALGO};
use crate::state::AppState;
use crate::ws::logs_ws;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state);
    Router::new()
        .route("/projects/", post(create_project).get(list_projects))
        .route("/projects/:project_id", get(get_project))
        .route("/projects/:project_id/quota", post(set_project_quota))
        .route("/work-items/", post(create_work_item))
        .route("/work-items/:wi_id", get(get_work_item))
        .route(
            "/work-items/:wi_id/tool-recipe",
            post(set_tool_recipe).get(get_tool_recipe),
        )
        .route("/work-items/:wi_id/policy", post(set_work_item_policy))
        .route(
            "/work-items/:wi_id/approvals",
            post(request_approval).get(list_approvals),
        )
        .route(
            "/work-items/approvals/:approval_id/approve",
            post(approve_request),
        )
        .route(
            "/work-items/approvals/:approval_id/reject",
            post(reject_request),
        )
        .route("/work-items/:wi_id/start", post(start_work_item))
        .route("/work-items/:wi_id/runs", get(list_runs))
        .route("/work-items/runs/:run_id", get(get_run))
        .route("/work-items/runs/:run_id/claim", post(claim_run))
        .route("/work-items/runs/:run_id/heartbeat", post(heartbeat_run))
        .route("/work-items/runs/:run_id/complete", post(complete_run))
        .route("/work-items/runs/:run_id/cancel", post(cancel_run))
        .route(
            "/work-items/runs/:run_id/logs",
            get(get_run_logs).post(append_run_log),
        )
        .route("/work-items/runs/:run_id/logs/ws", get(logs_ws))
        .route(
            "/work-items/runs/:run_id/steps",
            post(create_run_step).get(list_run_steps),
        )
        .route("/work-items/runs/steps/:step_id", patch(update_run_step))
        .route(
            "/work-items/runs/:run_id/info-requests",
            post(create_info_request).get(list_info_requests),
        )
        .route(
            "/work-items/runs/info-requests/:req_id/respond",
            post(respond_info_request),
        )
        .route("/scheduler/enqueue", post(scheduler_enqueue))
        .route("/scheduler/tick", post(scheduler_tick))
        .route("/scheduler/queue", get(scheduler_queue))
        .route("/scheduler/requeue/work-item", post(requeue_work_item))
        .route("/scheduler/requeue/run/:run_id", post(requeue_run))
        .route("/observability/health", get(health))
        .route("/observability/ping", get(ping))
        .route("/observability/metrics", get(metrics))
        .route("/observability/traces", get(traces))
        .route("/observability/usage", get(usage))
        .route("/observability/runs/:run_id", get(run_detail))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(from_fn(request_log_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.config.cors_origin_list();
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<axum::http::HeaderValue> =
            origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

fn api_err(rid: &str) -> impl FnOnce(RuntimeError) -> ApiError + '_ {
    move |err| ApiError::from(err).with_request_id(rid.to_string())
}

fn created<T: serde::Serialize>(body: Json<ApiEnvelope<T>>) -> Response {
    (StatusCode::CREATED, body).into_response()
}

// ── projects ──

async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProjectCreateRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let quota = req
        .quota
        .map(ProjectQuota::from)
        .unwrap_or_else(|| state.config.default_quota());
    if quota.window_seconds <= 0 {
        return Err(ApiError::bad_request("quota.window_seconds must be > 0").with_request_id(rid));
    }
    let project = state
        .store
        .create_project(&req.name, req.description.as_deref(), quota)
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, ProjectOut::from_project(project))))
}

async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<ProjectOut>>>, ApiError> {
    let rid = request_id(&headers);
    let projects = state.store.list_projects().map_err(api_err(&rid))?;
    Ok(envelope(
        rid,
        projects.into_iter().map(ProjectOut::from_project).collect(),
    ))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ProjectOut>>, ApiError> {
    let rid = request_id(&headers);
    let project = state.store.get_project(project_id).map_err(api_err(&rid))?;
    Ok(envelope(rid, ProjectOut::from_project(project)))
}

async fn set_project_quota(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<QuotaBody>,
) -> Result<Json<ApiEnvelope<ProjectOut>>, ApiError> {
    let rid = request_id(&headers);
    let project = state
        .store
        .set_project_quota(project_id, req.into())
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, ProjectOut::from_project(project)))
}

// ── work items ──

async fn create_work_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WorkItemCreateRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let work_item = state
        .store
        .create_work_item(req.project_id, &req.title, req.description.as_deref())
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, WorkItemOut::from_work_item(work_item))))
}

async fn get_work_item(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<WorkItemOut>>, ApiError> {
    let rid = request_id(&headers);
    let work_item = state.store.get_work_item(wi_id).map_err(api_err(&rid))?;
    Ok(envelope(rid, WorkItemOut::from_work_item(work_item)))
}

async fn set_tool_recipe(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ToolRecipeRequest>,
) -> Result<Json<ApiEnvelope<WorkItemOut>>, ApiError> {
    let rid = request_id(&headers);
    if !req.recipe.is_object() {
        return Err(ApiError::bad_request("recipe must be a JSON object").with_request_id(rid));
    }
    let work_item = state
        .store
        .set_tool_recipe(wi_id, &req.recipe)
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, WorkItemOut::from_work_item(work_item)))
}

async fn get_tool_recipe(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Value>>, ApiError> {
    let rid = request_id(&headers);
    let work_item = state.store.get_work_item(wi_id).map_err(api_err(&rid))?;
    let recipe = work_item
        .tool_recipe
        .ok_or_else(|| ApiError::not_found("tool recipe not set").with_request_id(rid.clone()))?;
    Ok(envelope(rid, recipe))
}

async fn set_work_item_policy(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<PolicyUpdateRequest>,
) -> Result<Json<ApiEnvelope<WorkItemOut>>, ApiError> {
    let rid = request_id(&headers);
    let work_item = state
        .store
        .set_work_item_policy(
            wi_id,
            WorkItemPolicy {
                max_retries: req.max_retries,
                backoff_base_seconds: req.backoff_base_seconds,
                backoff_jitter_seconds: req.backoff_jitter_seconds,
            },
        )
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, WorkItemOut::from_work_item(work_item)))
}

// ── approvals ──

async fn request_approval(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<ApprovalCreateRequest>>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let reason = body.and_then(|Json(b)| b.reason);
    let approval = state
        .store
        .create_approval_request(wi_id, reason.as_deref(), state.clock.now())
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, ApprovalOut::from_approval(approval))))
}

async fn list_approvals(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<ApprovalOut>>>, ApiError> {
    let rid = request_id(&headers);
    state.store.get_work_item(wi_id).map_err(api_err(&rid))?;
    let approvals = state
        .store
        .list_approvals_for_work_item(wi_id)
        .map_err(api_err(&rid))?;
    Ok(envelope(
        rid,
        approvals.into_iter().map(ApprovalOut::from_approval).collect(),
    ))
}

async fn approve_request(
    State(state): State<AppState>,
    Path(approval_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ApprovalOut>>, ApiError> {
    decide_approval(state, approval_id, headers, true).await
}

async fn reject_request(
    State(state): State<AppState>,
    Path(approval_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ApprovalOut>>, ApiError> {
    decide_approval(state, approval_id, headers, false).await
}

async fn decide_approval(
    state: AppState,
    approval_id: i64,
    headers: HeaderMap,
    approve: bool,
) -> Result<Json<ApiEnvelope<ApprovalOut>>, ApiError> {
    let rid = request_id(&headers);
    let approval = state
        .store
        .decide_approval(approval_id, approve, state.clock.now())
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, ApprovalOut::from_approval(approval)))
}

// ── runs ──

async fn start_work_item(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let run = state
        .scheduler
        .start_work_item(wi_id)
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, RunOut::from_run(run))))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(wi_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<RunOut>>>, ApiError> {
    let rid = request_id(&headers);
    let runs = state
        .store
        .list_runs_for_work_item(wi_id)
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, runs.into_iter().map(RunOut::from_run).collect()))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<RunOut>>, ApiError> {
    let rid = request_id(&headers);
    let run = state.store.get_run(run_id).map_err(api_err(&rid))?;
    Ok(envelope(rid, RunOut::from_run(run)))
}

async fn claim_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ApiEnvelope<ClaimResponse>>, ApiError> {
    let rid = request_id(&headers);
    let outcome = state
        .lease
        .claim(run_id, &req.agent_id, req.ttl_seconds)
        .map_err(api_err(&rid))?;
    let response = match outcome {
        ClaimOutcome::Granted { run } => ClaimResponse {
            granted: true,
            claimed_by: run.claimed_by.clone(),
            claim_expires_at: run.claim_expires_at.map(|t| t.to_rfc3339()),
            run: Some(RunOut::from_run(run)),
        },
        ClaimOutcome::Busy {
            claimed_by,
            claim_expires_at,
        } => ClaimResponse {
            granted: false,
            claimed_by: Some(claimed_by),
            claim_expires_at: Some(claim_expires_at.to_rfc3339()),
            run: None,
        },
    };
    Ok(envelope(rid, response))
}

async fn heartbeat_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<ApiEnvelope<HeartbeatResponse>>, ApiError> {
    let rid = request_id(&headers);
    let outcome = state
        .lease
        .heartbeat(run_id, &req.agent_id, req.ttl_seconds)
        .map_err(api_err(&rid))?;
    let response = match outcome {
        HeartbeatOutcome::Ok { claim_expires_at } => HeartbeatResponse {
            ok: true,
            claim_expires_at: Some(claim_expires_at.to_rfc3339()),
        },
        HeartbeatOutcome::Lost => HeartbeatResponse {
            ok: false,
            claim_expires_at: None,
        },
    };
    Ok(envelope(rid, response))
}

async fn complete_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<CompleteQuery>,
    body: Option<Json<CompleteRequest>>,
) -> Result<Json<ApiEnvelope<CompleteResponse>>, ApiError> {
    let rid = request_id(&headers);
    let agent_id = body.and_then(|Json(b)| b.agent_id);
    let outcome = state
        .lifecycle
        .complete(run_id, query.success, agent_id.as_deref())
        .map_err(api_err(&rid))?;
    Ok(envelope(
        rid,
        CompleteResponse {
            run: RunOut::from_run(outcome.run),
            retry: outcome.retry.map(|retry| RetryOut {
                queue_entry_id: retry.queue_entry_id,
                scheduled_for: retry.scheduled_for.to_rfc3339(),
                next_attempt: retry.next_attempt,
            }),
        },
    ))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<RunOut>>, ApiError> {
    let rid = request_id(&headers);
    let run = state.lifecycle.cancel(run_id).map_err(api_err(&rid))?;
    Ok(envelope(rid, RunOut::from_run(run)))
}

// ── logs ──

async fn append_run_log(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<LogAppendRequest>,
) -> Result<Json<ApiEnvelope<LogEntryOut>>, ApiError> {
    let rid = request_id(&headers);
    let stream = req
        .parsed_stream()
        .map_err(|msg| ApiError::bad_request(msg).with_request_id(rid.clone()))?;
    let entry = state
        .lifecycle
        .append_log(run_id, stream, &req.text)
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, LogEntryOut::from_entry(entry)))
}

async fn get_run_logs(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let entries = state.store.list_logs(run_id).map_err(api_err(&rid))?;
    if query.format.as_deref() == Some("json") {
        let filtered: Vec<_> = entries
            .into_iter()
            .filter(|entry| {
                query
                    .q
                    .as_deref()
                    .map(|needle| entry.text.contains(needle))
                    .unwrap_or(true)
            })
            .collect();
        let total = filtered.len();
        let paged: Vec<LogEntryOut> = filtered
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(LogEntryOut::from_entry)
            .collect();
        let returned = paged.len();
        return Ok(envelope(
            rid,
            LogListResponse {
                total,
                returned,
                entries: paged,
            },
        )
        .into_response());
    }
    let mut text = String::new();
    for entry in &entries {
        text.push_str(&entry.text);
        text.push('\n');
    }
    Ok(([("content-type", "text/plain; charset=utf-8")], text).into_response())
}

// ── steps ──

async fn create_run_step(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<StepCreateRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let step = state
        .lifecycle
        .create_step(run_id, req.idx, &req.name)
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, StepOut::from_step(step))))
}

async fn list_run_steps(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<StepOut>>>, ApiError> {
    let rid = request_id(&headers);
    let steps = state.store.list_steps(run_id).map_err(api_err(&rid))?;
    Ok(envelope(rid, steps.into_iter().map(StepOut::from_step).collect()))
}

async fn update_run_step(
    State(state): State<AppState>,
    Path(step_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<StepUpdateRequest>,
) -> Result<Json<ApiEnvelope<StepOut>>, ApiError> {
    let rid = request_id(&headers);
    let status = req
        .parsed_status()
        .map_err(|msg| ApiError::bad_request(msg).with_request_id(rid.clone()))?;
    let step = state
        .lifecycle
        .update_step(step_id, status, req.started_at, req.finished_at, req.metadata)
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, StepOut::from_step(step)))
}

// ── info requests ──

async fn create_info_request(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<InfoRequestCreateRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let keys = req.keys.into_iter().map(Into::into).collect();
    let request = state
        .info
        .open(run_id, &req.agent_id, keys)
        .map_err(api_err(&rid))?;
    Ok(created(envelope(
        rid,
        InfoRequestOut::from_request(request, None, false),
    )))
}

async fn list_info_requests(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<InfoListQuery>,
) -> Result<Json<ApiEnvelope<Vec<InfoRequestOut>>>, ApiError> {
    let rid = request_id(&headers);
    let requests = state.info.list(run_id).map_err(api_err(&rid))?;
    let provided_secret = headers
        .get("x-maestro-secret")
        .and_then(|v| v.to_str().ok());
    let out = requests
        .into_iter()
        .map(|request| reveal_info_request(request, query.plaintext, provided_secret))
        .collect();
    Ok(envelope(rid, out))
}

/// Sealed responses open only with the requester's matching key; the
/// AEAD tag is the authentication, not a string compare.
fn reveal_info_request(
    request: InfoRequest,
    plaintext: bool,
    provided_secret: Option<&str>,
) -> InfoRequestOut {
    match request.response.clone() {
        None => InfoRequestOut::from_request(request, None, false),
        Some(StoredResponse::Plain(text)) => {
            let values = serde_json::from_str(&text).ok();
            InfoRequestOut::from_request(request, values, false)
        }
        Some(StoredResponse::Sealed { blob, .. }) => {
            let opened = if plaintext {
                provided_secret
                    .and_then(|secret| ResponseSealer::new(secret).open(&blob))
                    .and_then(|text| serde_json::from_str(&text).ok())
            } else {
                None
            };
            let redacted = opened.is_none();
            InfoRequestOut::from_request(request, opened, redacted)
        }
    }
}

async fn respond_info_request(
    State(state): State<AppState>,
    Path(req_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<InfoRespondRequest>,
) -> Result<Json<ApiEnvelope<InfoRequestOut>>, ApiError> {
    let rid = request_id(&headers);
    if !req.values.is_object() {
        return Err(ApiError::bad_request("values must be a JSON object").with_request_id(rid));
    }
    let text = req.values.to_string();
    let stored = match &state.sealer {
        Some(sealer) => {
            let blob = sealer
                .seal(&text)
                .map_err(|msg| ApiError::internal(msg).with_request_id(rid.clone()))?;
            StoredResponse::Sealed {
                algo: SEAL_ALGO.to_string(),
                blob,
            }
        }
        None => StoredResponse::Plain(text),
    };
    let request = state.info.respond(req_id, stored).map_err(api_err(&rid))?;
    let redacted = state.sealer.is_some();
    let values = if redacted { None } else { Some(req.values) };
    Ok(envelope(
        rid,
        InfoRequestOut::from_request(request, values, redacted),
    ))
}

// ── scheduler ──

async fn scheduler_enqueue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let entry = state
        .scheduler
        .enqueue(
            req.work_item_id,
            req.depends_on_work_item_id,
            req.priority,
            req.delay_seconds,
        )
        .map_err(api_err(&rid))?;
    Ok(created(envelope(rid, QueueEntryOut::from_entry(entry))))
}

async fn scheduler_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<TickResponse>>, ApiError> {
    let rid = request_id(&headers);
    // Reclaim expired leases first so their runs are promotable/claimable
    // by the pass that follows.
    state.lease.expire_scan().map_err(api_err(&rid))?;
    let summary = state.scheduler.tick().map_err(api_err(&rid))?;
    Ok(envelope(rid, TickResponse::from_summary(summary)))
}

async fn scheduler_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<QueueEntryOut>>>, ApiError> {
    let rid = request_id(&headers);
    let entries = state.scheduler.list_queue().map_err(api_err(&rid))?;
    Ok(envelope(
        rid,
        entries.into_iter().map(QueueEntryOut::from_entry).collect(),
    ))
}

async fn requeue_work_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<ApiEnvelope<QueueEntryOut>>, ApiError> {
    let rid = request_id(&headers);
    let entry = state
        .scheduler
        .requeue_work_item(req.work_item_id, req.priority, req.delay_seconds)
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, QueueEntryOut::from_entry(entry)))
}

async fn requeue_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<RequeueRunRequest>>,
) -> Result<Json<ApiEnvelope<QueueEntryOut>>, ApiError> {
    let rid = request_id(&headers);
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let entry = state
        .scheduler
        .requeue_run(
            run_id,
            req.priority.unwrap_or(0),
            req.backoff.unwrap_or(false),
            req.delay_seconds,
        )
        .map_err(api_err(&rid))?;
    Ok(envelope(rid, QueueEntryOut::from_entry(entry)))
}

// ── observability ──

async fn health(headers: HeaderMap) -> Json<ApiEnvelope<Value>> {
    envelope(request_id(&headers), serde_json::json!({"status": "ok"}))
}

async fn ping(headers: HeaderMap) -> Json<ApiEnvelope<Value>> {
    envelope(request_id(&headers), serde_json::json!({"pong": true}))
}

async fn metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<MetricsResponse>>, ApiError> {
    let rid = request_id(&headers);
    let counts = state.store.entity_counts().map_err(api_err(&rid))?;
    Ok(envelope(rid, MetricsResponse::from_counts(counts)))
}

async fn traces(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<TraceOut>>>, ApiError> {
    let rid = request_id(&headers);
    let runs = state.store.list_recent_runs(100).map_err(api_err(&rid))?;
    Ok(envelope(rid, runs.into_iter().map(TraceOut::from_run).collect()))
}

async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<Vec<UsageOut>>>, ApiError> {
    let rid = request_id(&headers);
    let snapshot = state
        .store
        .usage_snapshot(state.clock.now())
        .map_err(api_err(&rid))?;
    let out = snapshot
        .into_iter()
        .map(|usage| UsageOut {
            project_id: usage.project.id,
            name: usage.project.name,
            window_seconds: usage.project.quota.window_seconds,
            max_runs: usage.project.quota.max_runs,
            runs_in_window: usage.runs_in_window,
        })
        .collect();
    Ok(envelope(rid, out))
}

async fn run_detail(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<RunDetailResponse>>, ApiError> {
    let rid = request_id(&headers);
    let run = state.store.get_run(run_id).map_err(api_err(&rid))?;
    let steps = state.store.list_steps(run_id).map_err(api_err(&rid))?;
    let log_count = state.store.count_logs(run_id).map_err(api_err(&rid))?;
    Ok(envelope(
        rid,
        RunDetailResponse {
            run: RunOut::from_run(run),
            steps: steps.into_iter().map(StepOut::from_step).collect(),
            log_count,
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use maestro_runtime::{ManualClock, SqliteStore};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use super::build_router;
    use crate::config::Config;
    use crate::state::AppState;

    struct TestApp {
        router: Router,
        clock: ManualClock,
    }

    fn test_app(config: Config) -> TestApp {
        let clock = ManualClock::default();
        let store = SqliteStore::in_memory().expect("store");
        let state = AppState::assemble(config, store, Arc::new(clock.clone()));
        TestApp {
            router: build_router(state),
            clock,
        }
    }

    fn open_config() -> Config {
        Config {
            require_approval: false,
            ..Config::default()
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::empty()).unwrap()
            }
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn seed_work_item(app: &TestApp) -> (i64, i64) {
        let (status, project) = send(
            &app.router,
            Method::POST,
            "/projects/",
            Some(json!({"name": "atlas"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let project_id = project["data"]["id"].as_i64().unwrap();
        let (status, wi) = send(
            &app.router,
            Method::POST,
            "/work-items/",
            Some(json!({"project_id": project_id, "title": "deploy"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        (project_id, wi["data"]["id"].as_i64().unwrap())
    }

    #[tokio::test]
    async fn chained_dependency_flow_over_http() {
        let app = test_app(open_config());
        let (_, wi_a) = seed_work_item(&app).await;
        let (status, wi_b) = send(
            &app.router,
            Method::POST,
            "/work-items/",
            Some(json!({"project_id": 1, "title": "publish"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let wi_b = wi_b["data"]["id"].as_i64().unwrap();

        send(
            &app.router,
            Method::POST,
            "/scheduler/enqueue",
            Some(json!({"work_item_id": wi_a})),
        )
        .await;
        send(
            &app.router,
            Method::POST,
            "/scheduler/enqueue",
            Some(json!({"work_item_id": wi_b, "depends_on_work_item_id": wi_a})),
        )
        .await;

        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 1);
        let run_a = tick["data"]["promoted"][0]["run_id"].as_i64().unwrap();

        let (_, claim) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_a}/claim"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(claim["data"]["granted"], true);
        assert_eq!(claim["data"]["run"]["state"], "running");

        let (status, complete) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_a}/complete?success=true"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(complete["data"]["run"]["state"], "succeeded");
        assert!(complete["data"]["run"]["duration_seconds"].is_number());

        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 1);
        assert_eq!(tick["data"]["promoted"][0]["work_item_id"], wi_b);
    }

    #[tokio::test]
    async fn approval_gate_flow_over_http() {
        let app = test_app(Config::default());
        let (_, wi) = seed_work_item(&app).await;

        // Direct start is denied with a machine-readable reason.
        let (status, denied) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(denied["error"]["code"], "approval_required");

        send(
            &app.router,
            Method::POST,
            "/scheduler/enqueue",
            Some(json!({"work_item_id": wi})),
        )
        .await;
        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 0);

        let (_, approval) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/approvals"),
            Some(json!({"reason": "prod"})),
        )
        .await;
        let approval_id = approval["data"]["id"].as_i64().unwrap();
        send(
            &app.router,
            Method::POST,
            &format!("/work-items/approvals/{approval_id}/approve"),
            None,
        )
        .await;

        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 1);
    }

    #[tokio::test]
    async fn claim_of_a_held_run_reports_busy() {
        let app = test_app(open_config());
        let (_, wi) = seed_work_item(&app).await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();
        send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/claim"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;
        let (status, second) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/claim"),
            Some(json!({"agent_id": "agent-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["data"]["granted"], false);
        assert_eq!(second["data"]["claimed_by"], "agent-1");
    }

    #[tokio::test]
    async fn logs_round_trip_with_filters() {
        let app = test_app(open_config());
        let (_, wi) = seed_work_item(&app).await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();

        for i in 1..=10 {
            let stream = if i % 2 == 0 { "stderr" } else { "stdout" };
            send(
                &app.router,
                Method::POST,
                &format!("/work-items/runs/{run_id}/logs"),
                Some(json!({"text": format!("line {i}"), "stream": stream})),
            )
            .await;
        }

        let (status, logs) = send(
            &app.router,
            Method::GET,
            &format!("/work-items/runs/{run_id}/logs?format=json"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["data"]["total"], 10);
        let seqs: Vec<i64> = logs["data"]["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());

        let (_, filtered) = send(
            &app.router,
            Method::GET,
            &format!("/work-items/runs/{run_id}/logs?format=json&q=line%201&limit=1&offset=1"),
            None,
        )
        .await;
        // "line 1" and "line 10" match; offset skips the first.
        assert_eq!(filtered["data"]["total"], 2);
        assert_eq!(filtered["data"]["returned"], 1);
        assert_eq!(filtered["data"]["entries"][0]["text"], "line 10");
    }

    #[tokio::test]
    async fn step_indexes_are_dense_over_http() {
        let app = test_app(open_config());
        let (_, wi) = seed_work_item(&app).await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/steps"),
            Some(json!({"idx": 0, "name": "plan"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, dup) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/steps"),
            Some(json!({"idx": 0, "name": "again"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(dup["error"]["code"], "conflict");

        let (status, gap) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/steps"),
            Some(json!({"idx": 3, "name": "later"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(gap["error"]["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let app = test_app(open_config());
        let (status, body) =
            send(&app.router, Method::GET, "/work-items/runs/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn rate_limit_returns_429_with_remaining_header() {
        let app = test_app(Config {
            rate_limit_per_min: 2,
            ..open_config()
        });
        for _ in 0..2 {
            let (status, _) =
                send(&app.router, Method::GET, "/observability/health", None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let request = Request::builder()
            .method(Method::GET)
            .uri("/observability/health")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok()),
            Some("0")
        );
    }

    #[tokio::test]
    async fn request_id_is_echoed_on_responses() {
        let app = test_app(open_config());
        let request = Request::builder()
            .method(Method::GET)
            .uri("/observability/health")
            .header("x-request-id", "req-echo-1")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok()),
            Some("req-echo-1")
        );
    }

    #[tokio::test]
    async fn sealed_info_responses_require_the_matching_secret() {
        let app = test_app(Config {
            secret_key: Some("vault-secret".into()),
            ..open_config()
        });
        let (_, wi) = seed_work_item(&app).await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();
        send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/claim"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;

        let (status, info) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/info-requests"),
            Some(json!({"agent_id": "agent-1", "keys": [{"name": "aws_region"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let req_id = info["data"]["id"].as_i64().unwrap();

        send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/info-requests/{req_id}/respond"),
            Some(json!({"values": {"aws_region": "eu-west-1"}})),
        )
        .await;

        // Without the secret the answer stays redacted.
        let (_, listed) = send(
            &app.router,
            Method::GET,
            &format!("/work-items/runs/{run_id}/info-requests?plaintext=true"),
            None,
        )
        .await;
        assert_eq!(listed["data"][0]["redacted"], true);
        assert!(listed["data"][0]["responses"].is_null());

        // With the matching key it opens.
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "/work-items/runs/{run_id}/info-requests?plaintext=true"
            ))
            .header("x-maestro-secret", "vault-secret")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"][0]["redacted"], false);
        assert_eq!(body["data"][0]["responses"]["aws_region"], "eu-west-1");
    }

    #[tokio::test]
    async fn retry_backoff_is_visible_through_the_api() {
        let app = test_app(open_config());
        let (_, wi) = seed_work_item(&app).await;
        send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/policy"),
            Some(json!({"max_retries": 2, "backoff_base_seconds": 1, "backoff_jitter_seconds": 0})),
        )
        .await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();
        send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/claim"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;

        let (_, complete) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/complete?success=false"),
            Some(json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(complete["data"]["run"]["state"], "failed");
        assert_eq!(complete["data"]["retry"]["next_attempt"], 2);

        // Before the backoff elapses the entry stays queued.
        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 0);

        app.clock.advance(chrono::Duration::milliseconds(1100));
        let (_, tick) = send(&app.router, Method::POST, "/scheduler/tick", None).await;
        assert_eq!(tick["data"]["processed"], 1);

        // A second completion of the failed run is a conflict and
        // leaves it untouched.
        let (status, conflict) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/runs/{run_id}/complete?success=true"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn observability_endpoints_report_counts_and_traces() {
        let app = test_app(open_config());
        let (_, wi) = seed_work_item(&app).await;
        let (_, run) = send(
            &app.router,
            Method::POST,
            &format!("/work-items/{wi}/start"),
            None,
        )
        .await;
        let run_id = run["data"]["id"].as_i64().unwrap();

        let (_, metrics) = send(&app.router, Method::GET, "/observability/metrics", None).await;
        assert_eq!(metrics["data"]["projects"], 1);
        assert_eq!(metrics["data"]["work_items"], 1);
        assert_eq!(metrics["data"]["runs"], 1);

        let (_, traces) = send(&app.router, Method::GET, "/observability/traces", None).await;
        assert_eq!(traces["data"][0]["run_id"], run_id);
        assert!(traces["data"][0]["trace_id"].is_string());

        let (_, usage) = send(&app.router, Method::GET, "/observability/usage", None).await;
        assert_eq!(usage["data"][0]["runs_in_window"], 1);

        let (_, detail) = send(
            &app.router,
            Method::GET,
            &format!("/observability/runs/{run_id}"),
            None,
        )
        .await;
        assert_eq!(detail["data"]["run"]["id"], run_id);
        assert_eq!(detail["data"]["log_count"], 0);
    }
}
