//! SQLite-backed store for all control-plane entities.
//!
//! One connection behind a mutex; every compound state transition runs
//! inside a single `rusqlite` transaction on that connection, which is
//! the row-lock isolation the higher layers rely on. Component modules
//! (lease, scheduler, lifecycle) build their transitions from the
//! `pub(crate)` row helpers below via [SqliteStore::with_tx].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use serde_json::Value;

use crate::error::{map_sqlite_err, Result, RuntimeError};
use crate::models::{
    ApprovalRequest, ApprovalState, InfoKey, InfoRequest, InfoRequestState, LogEntry, LogStream,
    Project, ProjectQuota, QueueEntry, QueueEntryState, Run, RunState, RunStep, StepStatus,
    StoredResponse, WorkItem, WorkItemPolicy,
};

const SCHEMA_VERSION: i64 = 3;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RuntimeError::Internal(format!("open sqlite store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Fresh in-memory store, used throughout the test suites.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RuntimeError::internal("store lock poisoned"))?;
        f(&conn)
    }

    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| RuntimeError::internal("store lock poisoned"))?;
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_err("begin transaction", e))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| map_sqlite_err("commit", e))?;
        Ok(out)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at_ms INTEGER NOT NULL
                )",
                [],
            )
            .map_err(|e| map_sqlite_err("create migrations table", e))?;
            let current: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| map_sqlite_err("read schema version", e))?;
            if current > SCHEMA_VERSION {
                return Err(RuntimeError::internal(format!(
                    "schema version {current} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            if current < 1 {
                apply_migration_v1(conn)?;
                record_migration(conn, 1, "baseline_control_plane_tables")?;
            }
            if current < 2 {
                apply_migration_v2(conn)?;
                record_migration(conn, 2, "info_request_sealed_responses")?;
            }
            if current < 3 {
                apply_migration_v3(conn)?;
                record_migration(conn, 3, "agent_registry")?;
            }
            Ok(())
        })
    }

    // ── projects ──

    pub fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        quota: ProjectQuota,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(RuntimeError::validation("project name must not be empty"));
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (name, description, quota_window_seconds, quota_max_runs)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, description, quota.window_seconds, quota.max_runs],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    RuntimeError::conflict(format!("project name already exists: {name}"))
                } else {
                    map_sqlite_err("insert project", e)
                }
            })?;
            let id = conn.last_insert_rowid();
            Ok(Project {
                id,
                name: name.to_string(),
                description: description.map(str::to_string),
                quota,
            })
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Project> {
        self.with_conn(|conn| {
            project_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("project {id} not found")))
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, description, quota_window_seconds, quota_max_runs
                     FROM projects ORDER BY id ASC",
                )
                .map_err(|e| map_sqlite_err("prepare list projects", e))?;
            let rows = stmt
                .query_map([], map_project)
                .map_err(|e| map_sqlite_err("query projects", e))?;
            collect_rows(rows, "list projects")
        })
    }

    pub fn set_project_quota(&self, id: i64, quota: ProjectQuota) -> Result<Project> {
        if quota.window_seconds <= 0 {
            return Err(RuntimeError::validation("quota window_seconds must be > 0"));
        }
        if quota.max_runs < 0 {
            return Err(RuntimeError::validation("quota max_runs must be >= 0"));
        }
        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE projects SET quota_window_seconds = ?2, quota_max_runs = ?3
                     WHERE id = ?1",
                    params![id, quota.window_seconds, quota.max_runs],
                )
                .map_err(|e| map_sqlite_err("set project quota", e))?;
            if updated == 0 {
                return Err(RuntimeError::not_found(format!("project {id} not found")));
            }
            project_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("project {id} not found")))
        })
    }

    // ── work items ──

    pub fn create_work_item(
        &self,
        project_id: i64,
        title: &str,
        description: Option<&str>,
    ) -> Result<WorkItem> {
        if title.trim().is_empty() {
            return Err(RuntimeError::validation("work item title must not be empty"));
        }
        self.with_conn(|conn| {
            if project_row(conn, project_id)?.is_none() {
                return Err(RuntimeError::not_found(format!(
                    "project {project_id} not found"
                )));
            }
            conn.execute(
                "INSERT INTO work_items (project_id, title, description) VALUES (?1, ?2, ?3)",
                params![project_id, title, description],
            )
            .map_err(|e| map_sqlite_err("insert work item", e))?;
            let id = conn.last_insert_rowid();
            work_item_row(conn, id)?
                .ok_or_else(|| RuntimeError::internal("work item vanished after insert"))
        })
    }

    pub fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        self.with_conn(|conn| {
            work_item_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("work item {id} not found")))
        })
    }

    pub fn set_tool_recipe(&self, id: i64, recipe: &Value) -> Result<WorkItem> {
        let encoded = serde_json::to_string(recipe)
            .map_err(|e| RuntimeError::validation(format!("tool recipe is not valid JSON: {e}")))?;
        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE work_items SET tool_recipe = ?2 WHERE id = ?1",
                    params![id, encoded],
                )
                .map_err(|e| map_sqlite_err("set tool recipe", e))?;
            if updated == 0 {
                return Err(RuntimeError::not_found(format!("work item {id} not found")));
            }
            work_item_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("work item {id} not found")))
        })
    }

    pub fn set_work_item_policy(&self, id: i64, policy: WorkItemPolicy) -> Result<WorkItem> {
        if matches!(policy.backoff_base_seconds, Some(v) if v < 0)
            || matches!(policy.backoff_jitter_seconds, Some(v) if v < 0)
        {
            return Err(RuntimeError::validation("backoff seconds must be >= 0"));
        }
        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE work_items SET
                        max_retries = COALESCE(?2, max_retries),
                        backoff_base_seconds = COALESCE(?3, backoff_base_seconds),
                        backoff_jitter_seconds = COALESCE(?4, backoff_jitter_seconds)
                     WHERE id = ?1",
                    params![
                        id,
                        policy.max_retries,
                        policy.backoff_base_seconds,
                        policy.backoff_jitter_seconds
                    ],
                )
                .map_err(|e| map_sqlite_err("set work item policy", e))?;
            if updated == 0 {
                return Err(RuntimeError::not_found(format!("work item {id} not found")));
            }
            work_item_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("work item {id} not found")))
        })
    }

    // ── approvals ──

    pub fn create_approval_request(
        &self,
        work_item_id: i64,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        self.with_conn(|conn| {
            if work_item_row(conn, work_item_id)?.is_none() {
                return Err(RuntimeError::not_found(format!(
                    "work item {work_item_id} not found"
                )));
            }
            conn.execute(
                "INSERT INTO approval_requests (work_item_id, state, reason, created_at_ms)
                 VALUES (?1, 'pending', ?2, ?3)",
                params![work_item_id, reason, dt_to_ms(now)],
            )
            .map_err(|e| map_sqlite_err("insert approval request", e))?;
            let id = conn.last_insert_rowid();
            approval_row(conn, id)?
                .ok_or_else(|| RuntimeError::internal("approval vanished after insert"))
        })
    }

    pub fn get_approval_request(&self, id: i64) -> Result<ApprovalRequest> {
        self.with_conn(|conn| {
            approval_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("approval {id} not found")))
        })
    }

    /// Decide a pending request. Terminal approval states are immutable.
    pub fn decide_approval(
        &self,
        id: i64,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let decided = if approve {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        };
        self.with_tx(|tx| {
            let existing = approval_row(tx, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("approval {id} not found")))?;
            if existing.state != ApprovalState::Pending {
                return Err(RuntimeError::conflict(format!(
                    "approval {id} already decided: {}",
                    existing.state.as_str()
                )));
            }
            tx.execute(
                "UPDATE approval_requests SET state = ?2, decided_at_ms = ?3
                 WHERE id = ?1 AND state = 'pending'",
                params![id, decided.as_str(), dt_to_ms(now)],
            )
            .map_err(|e| map_sqlite_err("decide approval", e))?;
            approval_row(tx, id)?
                .ok_or_else(|| RuntimeError::internal("approval vanished after decide"))
        })
    }

    pub fn list_approvals_for_work_item(&self, work_item_id: i64) -> Result<Vec<ApprovalRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, work_item_id, state, reason, created_at_ms, decided_at_ms
                     FROM approval_requests WHERE work_item_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| map_sqlite_err("prepare list approvals", e))?;
            let rows = stmt
                .query_map(params![work_item_id], map_approval)
                .map_err(|e| map_sqlite_err("query approvals", e))?;
            collect_rows(rows, "list approvals")
        })
    }

    // ── queue ──

    pub fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, work_item_id, depends_on_work_item_id, priority,
                            scheduled_for_ms, enqueued_at_ms, state
                     FROM queue_entries ORDER BY id ASC",
                )
                .map_err(|e| map_sqlite_err("prepare list queue", e))?;
            let rows = stmt
                .query_map([], map_queue_entry)
                .map_err(|e| map_sqlite_err("query queue", e))?;
            collect_rows(rows, "list queue")
        })
    }

    // ── runs ──

    pub fn get_run(&self, id: i64) -> Result<Run> {
        self.with_conn(|conn| {
            run_row(conn, id)?.ok_or_else(|| RuntimeError::not_found(format!("run {id} not found")))
        })
    }

    pub fn list_runs_for_work_item(&self, work_item_id: i64) -> Result<Vec<Run>> {
        self.with_conn(|conn| {
            if work_item_row(conn, work_item_id)?.is_none() {
                return Err(RuntimeError::not_found(format!(
                    "work item {work_item_id} not found"
                )));
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE work_item_id = ?1 ORDER BY id ASC"
                ))
                .map_err(|e| map_sqlite_err("prepare list runs", e))?;
            let rows = stmt
                .query_map(params![work_item_id], map_run)
                .map_err(|e| map_sqlite_err("query runs", e))?;
            collect_rows(rows, "list runs")
        })
    }

    pub fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
                ))
                .map_err(|e| map_sqlite_err("prepare recent runs", e))?;
            let rows = stmt
                .query_map(params![limit as i64], map_run)
                .map_err(|e| map_sqlite_err("query recent runs", e))?;
            collect_rows(rows, "recent runs")
        })
    }

    // ── steps ──

    pub fn list_steps(&self, run_id: i64) -> Result<Vec<RunStep>> {
        self.with_conn(|conn| {
            if run_row(conn, run_id)?.is_none() {
                return Err(RuntimeError::not_found(format!("run {run_id} not found")));
            }
            let mut stmt = conn
                .prepare(
                    "SELECT id, run_id, idx, name, status, started_at_ms, finished_at_ms, metadata
                     FROM run_steps WHERE run_id = ?1 ORDER BY idx ASC",
                )
                .map_err(|e| map_sqlite_err("prepare list steps", e))?;
            let rows = stmt
                .query_map(params![run_id], map_step)
                .map_err(|e| map_sqlite_err("query steps", e))?;
            collect_rows(rows, "list steps")
        })
    }

    // ── logs ──

    pub fn list_logs(&self, run_id: i64) -> Result<Vec<LogEntry>> {
        self.with_conn(|conn| {
            if run_row(conn, run_id)?.is_none() {
                return Err(RuntimeError::not_found(format!("run {run_id} not found")));
            }
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, seq, timestamp_ms, stream, text
                     FROM log_entries WHERE run_id = ?1 ORDER BY seq ASC",
                )
                .map_err(|e| map_sqlite_err("prepare list logs", e))?;
            let rows = stmt
                .query_map(params![run_id], map_log)
                .map_err(|e| map_sqlite_err("query logs", e))?;
            collect_rows(rows, "list logs")
        })
    }

    pub fn count_logs(&self, run_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM log_entries WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(|e| map_sqlite_err("count logs", e))
        })
    }

    // ── info requests ──

    pub fn get_info_request(&self, id: i64) -> Result<InfoRequest> {
        self.with_conn(|conn| {
            info_request_row(conn, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("info request {id} not found")))
        })
    }

    pub fn list_info_requests(&self, run_id: i64) -> Result<Vec<InfoRequest>> {
        self.with_conn(|conn| {
            if run_row(conn, run_id)?.is_none() {
                return Err(RuntimeError::not_found(format!("run {run_id} not found")));
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {INFO_COLUMNS} FROM info_requests WHERE run_id = ?1 ORDER BY id ASC"
                ))
                .map_err(|e| map_sqlite_err("prepare list info requests", e))?;
            let rows = stmt
                .query_map(params![run_id], map_info_request)
                .map_err(|e| map_sqlite_err("query info requests", e))?;
            collect_rows(rows, "list info requests")
        })
    }

    // ── observability ──

    pub fn entity_counts(&self) -> Result<EntityCounts> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<i64> {
                conn.query_row(sql, [], |row| row.get(0))
                    .map_err(|e| map_sqlite_err("count entities", e))
            };
            Ok(EntityCounts {
                projects: count("SELECT COUNT(*) FROM projects")?,
                work_items: count("SELECT COUNT(*) FROM work_items")?,
                runs: count("SELECT COUNT(*) FROM runs")?,
                queued_entries: count("SELECT COUNT(*) FROM queue_entries WHERE state = 'queued'")?,
                pending_approvals: count(
                    "SELECT COUNT(*) FROM approval_requests WHERE state = 'pending'",
                )?,
                pending_info_requests: count(
                    "SELECT COUNT(*) FROM info_requests WHERE state = 'pending'",
                )?,
            })
        })
    }

    pub fn usage_snapshot(&self, now: DateTime<Utc>) -> Result<Vec<ProjectUsage>> {
        let projects = self.list_projects()?;
        self.with_conn(|conn| {
            projects
                .into_iter()
                .map(|project| {
                    let cutoff = now - chrono::Duration::seconds(project.quota.window_seconds);
                    let runs_in_window = count_run_starts_since(conn, project.id, cutoff)?;
                    Ok(ProjectUsage {
                        project,
                        runs_in_window,
                    })
                })
                .collect()
        })
    }

    pub fn touch_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| upsert_agent(conn, agent_id, now))
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct EntityCounts {
    pub projects: i64,
    pub work_items: i64,
    pub runs: i64,
    pub queued_entries: i64,
    pub pending_approvals: i64,
    pub pending_info_requests: i64,
}

#[derive(Clone, Debug)]
pub struct ProjectUsage {
    pub project: Project,
    pub runs_in_window: i64,
}

// ── migrations ──

fn apply_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            quota_window_seconds INTEGER NOT NULL DEFAULT 86400,
            quota_max_runs INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE work_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            title TEXT NOT NULL,
            description TEXT,
            tool_recipe TEXT,
            max_retries INTEGER,
            backoff_base_seconds INTEGER,
            backoff_jitter_seconds INTEGER
        );
        CREATE TABLE approval_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_item_id INTEGER NOT NULL REFERENCES work_items(id),
            state TEXT NOT NULL DEFAULT 'pending',
            reason TEXT,
            created_at_ms INTEGER NOT NULL,
            decided_at_ms INTEGER
        );
        CREATE TABLE queue_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_item_id INTEGER NOT NULL REFERENCES work_items(id),
            depends_on_work_item_id INTEGER REFERENCES work_items(id),
            priority INTEGER NOT NULL DEFAULT 0,
            scheduled_for_ms INTEGER NOT NULL,
            enqueued_at_ms INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued'
        );
        CREATE INDEX idx_queue_entries_due ON queue_entries(state, scheduled_for_ms);
        CREATE TABLE runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_item_id INTEGER NOT NULL REFERENCES work_items(id),
            state TEXT NOT NULL DEFAULT 'queued',
            attempt INTEGER NOT NULL DEFAULT 1,
            trace_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            started_at_ms INTEGER,
            finished_at_ms INTEGER,
            claimed_by TEXT,
            claim_expires_at_ms INTEGER,
            last_heartbeat_at_ms INTEGER
        );
        CREATE INDEX idx_runs_work_item ON runs(work_item_id);
        CREATE INDEX idx_runs_claim_expiry ON runs(state, claim_expires_at_ms);
        CREATE TABLE run_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            started_at_ms INTEGER,
            finished_at_ms INTEGER,
            metadata TEXT,
            UNIQUE(run_id, idx)
        );
        CREATE TABLE log_entries (
            run_id INTEGER NOT NULL REFERENCES runs(id),
            seq INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            stream TEXT NOT NULL,
            text TEXT NOT NULL,
            PRIMARY KEY (run_id, seq)
        );
        CREATE TABLE info_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            keys TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            response TEXT,
            created_at_ms INTEGER NOT NULL,
            answered_at_ms INTEGER
        );",
    )
    .map_err(|e| map_sqlite_err("apply migration v1", e))
}

fn apply_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE info_requests ADD COLUMN response_cipher BLOB;
         ALTER TABLE info_requests ADD COLUMN cipher_algo TEXT;",
    )
    .map_err(|e| map_sqlite_err("apply migration v2", e))
}

fn apply_migration_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE agents (
            id TEXT PRIMARY KEY,
            last_seen_at_ms INTEGER NOT NULL
        );",
    )
    .map_err(|e| map_sqlite_err("apply migration v3", e))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| map_sqlite_err("record migration", e))?;
    Ok(())
}

// ── time and error helpers ──

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
    )
}

fn collect_rows<T>(
    rows: impl Iterator<Item = std::result::Result<T, rusqlite::Error>>,
    context: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| map_sqlite_err(context, e))?);
    }
    Ok(out)
}

// ── row mapping ──

pub(crate) const RUN_COLUMNS: &str = "id, work_item_id, state, attempt, trace_id, created_at_ms, \
     started_at_ms, finished_at_ms, claimed_by, claim_expires_at_ms, last_heartbeat_at_ms";

const INFO_COLUMNS: &str =
    "id, run_id, keys, state, response, response_cipher, cipher_algo, created_at_ms, answered_at_ms";

fn map_project(row: &rusqlite::Row<'_>) -> std::result::Result<Project, rusqlite::Error> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        quota: ProjectQuota {
            window_seconds: row.get(3)?,
            max_runs: row.get(4)?,
        },
    })
}

fn map_work_item(row: &rusqlite::Row<'_>) -> std::result::Result<WorkItem, rusqlite::Error> {
    let recipe: Option<String> = row.get(4)?;
    Ok(WorkItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        tool_recipe: recipe.and_then(|text| serde_json::from_str(&text).ok()),
        policy: WorkItemPolicy {
            max_retries: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
            backoff_base_seconds: row.get(6)?,
            backoff_jitter_seconds: row.get(7)?,
        },
    })
}

fn map_approval(row: &rusqlite::Row<'_>) -> std::result::Result<ApprovalRequest, rusqlite::Error> {
    Ok(ApprovalRequest {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        state: ApprovalState::parse(&row.get::<_, String>(2)?),
        reason: row.get(3)?,
        created_at: ms_to_dt(row.get(4)?),
        decided_at: row.get::<_, Option<i64>>(5)?.map(ms_to_dt),
    })
}

fn map_queue_entry(row: &rusqlite::Row<'_>) -> std::result::Result<QueueEntry, rusqlite::Error> {
    Ok(QueueEntry {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        depends_on_work_item_id: row.get(2)?,
        priority: row.get(3)?,
        scheduled_for: ms_to_dt(row.get(4)?),
        enqueued_at: ms_to_dt(row.get(5)?),
        state: QueueEntryState::parse(&row.get::<_, String>(6)?),
    })
}

fn map_run(row: &rusqlite::Row<'_>) -> std::result::Result<Run, rusqlite::Error> {
    Ok(Run {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        state: RunState::parse(&row.get::<_, String>(2)?),
        attempt: row.get::<_, i64>(3)? as u32,
        trace_id: row.get(4)?,
        created_at: ms_to_dt(row.get(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
        finished_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
        claimed_by: row.get(8)?,
        claim_expires_at: row.get::<_, Option<i64>>(9)?.map(ms_to_dt),
        last_heartbeat_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
    })
}

fn map_step(row: &rusqlite::Row<'_>) -> std::result::Result<RunStep, rusqlite::Error> {
    let metadata: Option<String> = row.get(7)?;
    Ok(RunStep {
        id: row.get(0)?,
        run_id: row.get(1)?,
        idx: row.get::<_, i64>(2)? as u32,
        name: row.get(3)?,
        status: StepStatus::parse(&row.get::<_, String>(4)?).unwrap_or(StepStatus::Pending),
        started_at: row.get::<_, Option<i64>>(5)?.map(ms_to_dt),
        finished_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
        metadata: metadata.and_then(|text| serde_json::from_str(&text).ok()),
    })
}

fn map_log(row: &rusqlite::Row<'_>) -> std::result::Result<LogEntry, rusqlite::Error> {
    Ok(LogEntry {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        timestamp: ms_to_dt(row.get(2)?),
        stream: LogStream::parse(&row.get::<_, String>(3)?).unwrap_or(LogStream::System),
        text: row.get(4)?,
    })
}

fn map_info_request(row: &rusqlite::Row<'_>) -> std::result::Result<InfoRequest, rusqlite::Error> {
    let keys: String = row.get(2)?;
    let plain: Option<String> = row.get(4)?;
    let cipher: Option<Vec<u8>> = row.get(5)?;
    let algo: Option<String> = row.get(6)?;
    let response = match (plain, cipher, algo) {
        (_, Some(blob), Some(algo)) => Some(StoredResponse::Sealed { algo, blob }),
        (Some(text), _, _) => Some(StoredResponse::Plain(text)),
        _ => None,
    };
    Ok(InfoRequest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        keys: serde_json::from_str(&keys).unwrap_or_default(),
        state: InfoRequestState::parse(&row.get::<_, String>(3)?),
        response,
        created_at: ms_to_dt(row.get(7)?),
        answered_at: row.get::<_, Option<i64>>(8)?.map(ms_to_dt),
    })
}

// ── row helpers shared with the component modules ──

pub(crate) fn project_row(conn: &Connection, id: i64) -> Result<Option<Project>> {
    conn.query_row(
        "SELECT id, name, description, quota_window_seconds, quota_max_runs
         FROM projects WHERE id = ?1",
        params![id],
        map_project,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read project", e))
}

pub(crate) fn work_item_row(conn: &Connection, id: i64) -> Result<Option<WorkItem>> {
    conn.query_row(
        "SELECT id, project_id, title, description, tool_recipe,
                max_retries, backoff_base_seconds, backoff_jitter_seconds
         FROM work_items WHERE id = ?1",
        params![id],
        map_work_item,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read work item", e))
}

pub(crate) fn approval_row(conn: &Connection, id: i64) -> Result<Option<ApprovalRequest>> {
    conn.query_row(
        "SELECT id, work_item_id, state, reason, created_at_ms, decided_at_ms
         FROM approval_requests WHERE id = ?1",
        params![id],
        map_approval,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read approval", e))
}

pub(crate) fn run_row(conn: &Connection, id: i64) -> Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
        params![id],
        map_run,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read run", e))
}

pub(crate) fn step_row(conn: &Connection, id: i64) -> Result<Option<RunStep>> {
    conn.query_row(
        "SELECT id, run_id, idx, name, status, started_at_ms, finished_at_ms, metadata
         FROM run_steps WHERE id = ?1",
        params![id],
        map_step,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read step", e))
}

pub(crate) fn info_request_row(conn: &Connection, id: i64) -> Result<Option<InfoRequest>> {
    conn.query_row(
        &format!("SELECT {INFO_COLUMNS} FROM info_requests WHERE id = ?1"),
        params![id],
        map_info_request,
    )
    .optional()
    .map_err(|e| map_sqlite_err("read info request", e))
}

/// Queued entries due at `now`, in promotion order: priority descending,
/// then enqueue time, then id. The order is total, so ticks over an
/// unchanged queue are deterministic.
pub(crate) fn due_queue_entries(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, work_item_id, depends_on_work_item_id, priority,
                    scheduled_for_ms, enqueued_at_ms, state
             FROM queue_entries
             WHERE state = 'queued' AND scheduled_for_ms <= ?1
             ORDER BY priority DESC, enqueued_at_ms ASC, id ASC",
        )
        .map_err(|e| map_sqlite_err("prepare due entries", e))?;
    let rows = stmt
        .query_map(params![dt_to_ms(now)], map_queue_entry)
        .map_err(|e| map_sqlite_err("query due entries", e))?;
    collect_rows(rows, "due entries")
}

pub(crate) fn insert_queue_entry(
    conn: &Connection,
    work_item_id: i64,
    depends_on_work_item_id: Option<i64>,
    priority: i64,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<QueueEntry> {
    conn.execute(
        "INSERT INTO queue_entries
            (work_item_id, depends_on_work_item_id, priority, scheduled_for_ms, enqueued_at_ms, state)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued')",
        params![
            work_item_id,
            depends_on_work_item_id,
            priority,
            dt_to_ms(scheduled_for),
            dt_to_ms(now)
        ],
    )
    .map_err(|e| map_sqlite_err("insert queue entry", e))?;
    Ok(QueueEntry {
        id: conn.last_insert_rowid(),
        work_item_id,
        depends_on_work_item_id,
        priority,
        scheduled_for,
        enqueued_at: now,
        state: QueueEntryState::Queued,
    })
}

/// Consume a queued entry; returns false if it was already consumed.
pub(crate) fn consume_queue_entry(conn: &Connection, id: i64) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE queue_entries SET state = 'consumed' WHERE id = ?1 AND state = 'queued'",
            params![id],
        )
        .map_err(|e| map_sqlite_err("consume queue entry", e))?;
    Ok(updated == 1)
}

/// Most recent terminal run state for a work item, if any terminal run
/// exists. Dependencies are judged against this.
pub(crate) fn most_recent_terminal_run_state(
    conn: &Connection,
    work_item_id: i64,
) -> Result<Option<RunState>> {
    conn.query_row(
        "SELECT state FROM runs
         WHERE work_item_id = ?1 AND state IN ('succeeded', 'failed', 'cancelled')
         ORDER BY id DESC LIMIT 1",
        params![work_item_id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| map_sqlite_err("read terminal run state", e))
    .map(|state| state.as_deref().map(RunState::parse))
}

pub(crate) fn has_running_run(conn: &Connection, work_item_id: i64) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM runs WHERE work_item_id = ?1 AND state = 'running'",
            params![work_item_id],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite_err("count running runs", e))?;
    Ok(count > 0)
}

pub(crate) fn count_run_starts_since(
    conn: &Connection,
    project_id: i64,
    cutoff: DateTime<Utc>,
) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM runs r
         JOIN work_items w ON w.id = r.work_item_id
         WHERE w.project_id = ?1 AND r.created_at_ms > ?2",
        params![project_id, dt_to_ms(cutoff)],
        |row| row.get(0),
    )
    .map_err(|e| map_sqlite_err("count run starts", e))
}

/// Create a fresh claimable run for a work item. The attempt number
/// continues the work item's lifetime sequence.
pub(crate) fn insert_run(conn: &Connection, work_item_id: i64, now: DateTime<Utc>) -> Result<Run> {
    let prior_attempts: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM runs WHERE work_item_id = ?1",
            params![work_item_id],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite_err("read prior attempts", e))?;
    let attempt = prior_attempts + 1;
    let trace_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO runs (work_item_id, state, attempt, trace_id, created_at_ms)
         VALUES (?1, 'queued', ?2, ?3, ?4)",
        params![work_item_id, attempt, trace_id, dt_to_ms(now)],
    )
    .map_err(|e| map_sqlite_err("insert run", e))?;
    Ok(Run {
        id: conn.last_insert_rowid(),
        work_item_id,
        state: RunState::Queued,
        attempt: attempt as u32,
        trace_id,
        created_at: now,
        started_at: None,
        finished_at: None,
        claimed_by: None,
        claim_expires_at: None,
        last_heartbeat_at: None,
    })
}

/// Append a log line, assigning the next per-run sequence number inside
/// the caller's transaction.
pub(crate) fn append_log_entry(
    conn: &Connection,
    run_id: i64,
    stream: LogStream,
    text: &str,
    now: DateTime<Utc>,
) -> Result<LogEntry> {
    let seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM log_entries WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite_err("next log seq", e))?;
    conn.execute(
        "INSERT INTO log_entries (run_id, seq, timestamp_ms, stream, text)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, seq, dt_to_ms(now), stream.as_str(), text],
    )
    .map_err(|e| map_sqlite_err("insert log entry", e))?;
    Ok(LogEntry {
        run_id,
        seq,
        timestamp: now,
        stream,
        text: text.to_string(),
    })
}

pub(crate) fn insert_info_request(
    conn: &Connection,
    run_id: i64,
    keys: &[InfoKey],
    now: DateTime<Utc>,
) -> Result<InfoRequest> {
    let encoded = serde_json::to_string(keys)
        .map_err(|e| RuntimeError::internal(format!("encode info keys: {e}")))?;
    conn.execute(
        "INSERT INTO info_requests (run_id, keys, state, created_at_ms)
         VALUES (?1, ?2, 'pending', ?3)",
        params![run_id, encoded, dt_to_ms(now)],
    )
    .map_err(|e| map_sqlite_err("insert info request", e))?;
    Ok(InfoRequest {
        id: conn.last_insert_rowid(),
        run_id,
        keys: keys.to_vec(),
        state: InfoRequestState::Pending,
        response: None,
        created_at: now,
        answered_at: None,
    })
}

pub(crate) fn store_info_response(
    conn: &Connection,
    id: i64,
    response: &StoredResponse,
    now: DateTime<Utc>,
) -> Result<()> {
    let (plain, cipher, algo): (Option<&str>, Option<&[u8]>, Option<&str>) = match response {
        StoredResponse::Plain(text) => (Some(text), None, None),
        StoredResponse::Sealed { algo, blob } => (None, Some(blob), Some(algo)),
    };
    conn.execute(
        "UPDATE info_requests
         SET state = 'answered', response = ?2, response_cipher = ?3, cipher_algo = ?4,
             answered_at_ms = ?5
         WHERE id = ?1",
        params![id, plain, cipher, algo, dt_to_ms(now)],
    )
    .map_err(|e| map_sqlite_err("store info response", e))?;
    Ok(())
}

pub(crate) fn upsert_agent(conn: &Connection, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO agents (id, last_seen_at_ms) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET last_seen_at_ms = excluded.last_seen_at_ms",
        params![agent_id, dt_to_ms(now)],
    )
    .map_err(|e| map_sqlite_err("upsert agent", e))?;
    Ok(())
}
