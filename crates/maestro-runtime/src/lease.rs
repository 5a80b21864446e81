//! Claim/heartbeat lease management: single-writer ownership of a run
//! with TTL reclaim.
//!
//! Every transition runs in one store transaction, so at most one agent
//! ever observes a granted claim for a run. Reclaims (direct claim of an
//! expired lease, or the periodic expire scan) increment the run's
//! attempt counter; the expire scan additionally honors the retry budget
//! and fails the run outright once it is exhausted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use crate::bus::{LogBus, RunEvent};
use crate::clock::Clock;
use crate::error::{map_sqlite_err, Result, RuntimeError};
use crate::models::{LogEntry, LogStream, Run, RunState};
use crate::retry::RetryPolicy;
use crate::store::{
    append_log_entry, dt_to_ms, run_row, upsert_agent, work_item_row, SqliteStore,
};

#[derive(Clone, Copy, Debug)]
pub struct LeaseConfig {
    pub default_ttl_seconds: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ClaimOutcome {
    Granted { run: Run },
    Busy {
        claimed_by: String,
        claim_expires_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
pub enum HeartbeatOutcome {
    Ok { claim_expires_at: DateTime<Utc> },
    Lost,
}

#[derive(Clone, Debug, Default)]
pub struct ExpireScanOutcome {
    pub requeued: Vec<Run>,
    pub failed: Vec<Run>,
}

pub struct LeaseManager {
    store: SqliteStore,
    bus: Arc<LogBus>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    retry_defaults: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        store: SqliteStore,
        bus: Arc<LogBus>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        retry_defaults: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
            retry_defaults,
        }
    }

    fn ttl(&self, requested: Option<i64>) -> Result<Duration> {
        let seconds = requested.unwrap_or(self.config.default_ttl_seconds);
        if seconds <= 0 {
            return Err(RuntimeError::validation("ttl_seconds must be > 0"));
        }
        Ok(Duration::seconds(seconds))
    }

    /// Try to acquire exclusive ownership of a run.
    pub fn claim(
        &self,
        run_id: i64,
        agent_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<ClaimOutcome> {
        if agent_id.trim().is_empty() {
            return Err(RuntimeError::validation("agent_id must not be empty"));
        }
        let ttl = self.ttl(ttl_seconds)?;
        let now = self.clock.now();
        let (outcome, logs) = self.store.with_tx(|tx| {
            let run = run_row(tx, run_id)?
                .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
            if run.state.is_terminal() {
                return Err(RuntimeError::conflict(format!(
                    "run {run_id} is terminal: {}",
                    run.state.as_str()
                )));
            }
            let mut logs = Vec::new();
            let reclaim = match run.state {
                RunState::Queued => false,
                RunState::Running => {
                    let expired = run
                        .claim_expires_at
                        .map(|expires| expires <= now)
                        .unwrap_or(true);
                    if !expired {
                        return Ok((
                            ClaimOutcome::Busy {
                                claimed_by: run.claimed_by.clone().unwrap_or_default(),
                                claim_expires_at: run.claim_expires_at.unwrap_or(now),
                            },
                            logs,
                        ));
                    }
                    true
                }
                _ => unreachable!("terminal states handled above"),
            };
            let attempt = if reclaim { run.attempt + 1 } else { run.attempt };
            let expires = now + ttl;
            tx.execute(
                "UPDATE runs SET state = 'running', attempt = ?2, claimed_by = ?3,
                        claim_expires_at_ms = ?4, last_heartbeat_at_ms = ?5,
                        started_at_ms = COALESCE(started_at_ms, ?5)
                 WHERE id = ?1",
                params![run_id, attempt, agent_id, dt_to_ms(expires), dt_to_ms(now)],
            )
            .map_err(|e| map_sqlite_err("grant claim", e))?;
            if reclaim {
                logs.push(append_log_entry(
                    tx,
                    run_id,
                    LogStream::System,
                    &format!(
                        "expired lease held by {} reclaimed by {agent_id} (attempt {attempt})",
                        run.claimed_by.as_deref().unwrap_or("unknown")
                    ),
                    now,
                )?);
            }
            upsert_agent(tx, agent_id, now)?;
            let run = run_row(tx, run_id)?
                .ok_or_else(|| RuntimeError::internal("run vanished during claim"))?;
            Ok((ClaimOutcome::Granted { run }, logs))
        })?;
        self.publish_logs(&logs);
        Ok(outcome)
    }

    /// Extend a held lease. `Lost` means the agent no longer owns the
    /// run and must stop working on it.
    pub fn heartbeat(
        &self,
        run_id: i64,
        agent_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<HeartbeatOutcome> {
        let ttl = self.ttl(ttl_seconds)?;
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let run = run_row(tx, run_id)?
                .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
            if run.state != RunState::Running || run.claimed_by.as_deref() != Some(agent_id) {
                return Ok(HeartbeatOutcome::Lost);
            }
            let expires = now + ttl;
            tx.execute(
                "UPDATE runs SET claim_expires_at_ms = ?2, last_heartbeat_at_ms = ?3
                 WHERE id = ?1 AND claimed_by = ?4 AND state = 'running'",
                params![run_id, dt_to_ms(expires), dt_to_ms(now), agent_id],
            )
            .map_err(|e| map_sqlite_err("extend lease", e))?;
            upsert_agent(tx, agent_id, now)?;
            Ok(HeartbeatOutcome::Ok {
                claim_expires_at: expires,
            })
        })
    }

    /// Move a run to a terminal state and clear its claim. Rejected when
    /// `expected_agent` is given and does not hold the lease.
    pub fn release(
        &self,
        run_id: i64,
        expected_agent: Option<&str>,
        final_state: RunState,
    ) -> Result<Run> {
        let now = self.clock.now();
        let (run, logs) = self
            .store
            .with_tx(|tx| release_in_tx(tx, run_id, expected_agent, final_state, now))?;
        self.publish_logs(&logs);
        Ok(run)
    }

    /// Periodic pass reclaiming runs whose lease expired without a
    /// heartbeat. Honors the per-work-item retry budget.
    pub fn expire_scan(&self) -> Result<ExpireScanOutcome> {
        let now = self.clock.now();
        let (outcome, logs) = self.store.with_tx(|tx| {
            let mut outcome = ExpireScanOutcome::default();
            let mut logs = Vec::new();
            for run in overdue_runs(tx, now)? {
                let work_item = work_item_row(tx, run.work_item_id)?.ok_or_else(|| {
                    RuntimeError::internal(format!(
                        "run {} references missing work item {}",
                        run.id, run.work_item_id
                    ))
                })?;
                let policy = self.retry_defaults.for_work_item(&work_item);
                let holder = run.claimed_by.as_deref().unwrap_or("unknown").to_string();
                if policy.allows_retry(run.attempt) {
                    let attempt = run.attempt + 1;
                    tx.execute(
                        "UPDATE runs SET state = 'queued', attempt = ?2, claimed_by = NULL,
                                claim_expires_at_ms = NULL
                         WHERE id = ?1 AND state = 'running'",
                        params![run.id, attempt],
                    )
                    .map_err(|e| map_sqlite_err("requeue expired run", e))?;
                    logs.push(append_log_entry(
                        tx,
                        run.id,
                        LogStream::System,
                        &format!(
                            "lease held by {holder} expired; run requeued (attempt {attempt})"
                        ),
                        now,
                    )?);
                    if let Some(run) = run_row(tx, run.id)? {
                        outcome.requeued.push(run);
                    }
                } else {
                    tx.execute(
                        "UPDATE runs SET state = 'failed', finished_at_ms = ?2,
                                claimed_by = NULL, claim_expires_at_ms = NULL
                         WHERE id = ?1 AND state = 'running'",
                        params![run.id, dt_to_ms(now)],
                    )
                    .map_err(|e| map_sqlite_err("fail expired run", e))?;
                    logs.push(append_log_entry(
                        tx,
                        run.id,
                        LogStream::System,
                        &format!("lease held by {holder} expired; retry budget exhausted"),
                        now,
                    )?);
                    if let Some(run) = run_row(tx, run.id)? {
                        outcome.failed.push(run);
                    }
                }
            }
            Ok((outcome, logs))
        })?;
        if !outcome.requeued.is_empty() || !outcome.failed.is_empty() {
            tracing::info!(
                requeued = outcome.requeued.len(),
                failed = outcome.failed.len(),
                "expire scan reclaimed runs"
            );
        }
        self.publish_logs(&logs);
        Ok(outcome)
    }

    /// Background expiry loop; one scan per interval, cancelled
    /// cooperatively on shutdown.
    pub async fn run_expire_loop(
        self: std::sync::Arc<Self>,
        interval: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.expire_scan() {
                        tracing::warn!(%err, "lease expire scan failed");
                    }
                }
            }
        }
    }

    fn publish_logs(&self, logs: &[LogEntry]) {
        for entry in logs {
            self.bus.publish(RunEvent::from_log(entry));
        }
    }
}

/// Shared terminal-release primitive; `complete` builds on this inside
/// its own transaction so retry scheduling stays atomic with release.
pub(crate) fn release_in_tx(
    tx: &Connection,
    run_id: i64,
    expected_agent: Option<&str>,
    final_state: RunState,
    now: DateTime<Utc>,
) -> Result<(Run, Vec<LogEntry>)> {
    debug_assert!(final_state.is_terminal());
    let run = run_row(tx, run_id)?
        .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
    if run.state.is_terminal() {
        return Err(RuntimeError::conflict(format!(
            "run {run_id} is already terminal: {}",
            run.state.as_str()
        )));
    }
    if let Some(agent) = expected_agent {
        if run.claimed_by.as_deref() != Some(agent) {
            return Err(RuntimeError::conflict(format!(
                "run {run_id} is not held by {agent}"
            )));
        }
    }
    tx.execute(
        "UPDATE runs SET state = ?2, finished_at_ms = ?3, claimed_by = NULL,
                claim_expires_at_ms = NULL
         WHERE id = ?1",
        params![run_id, final_state.as_str(), dt_to_ms(now)],
    )
    .map_err(|e| map_sqlite_err("release run", e))?;
    let note = match final_state {
        RunState::Succeeded => "completed successfully".to_string(),
        RunState::Cancelled => "cancelled by operator".to_string(),
        _ => format!("finished as {}", final_state.as_str()),
    };
    let log = append_log_entry(tx, run_id, LogStream::System, &note, now)?;
    let run = run_row(tx, run_id)?
        .ok_or_else(|| RuntimeError::internal("run vanished during release"))?;
    Ok((run, vec![log]))
}

fn overdue_runs(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Run>> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM runs
             WHERE state = 'running' AND claim_expires_at_ms IS NOT NULL
               AND claim_expires_at_ms < ?1
             ORDER BY id ASC",
        )
        .map_err(|e| map_sqlite_err("prepare overdue runs", e))?;
    let rows = stmt
        .query_map(params![dt_to_ms(now)], |row| row.get::<_, i64>(0))
        .map_err(|e| map_sqlite_err("query overdue runs", e))?;
    let mut out = Vec::new();
    for row in rows {
        let id = row.map_err(|e| map_sqlite_err("overdue run row", e))?;
        if let Some(run) = run_row(conn, id)? {
            out.push(run);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::ProjectQuota;
    use crate::store::insert_run;

    struct Harness {
        store: SqliteStore,
        clock: ManualClock,
        manager: LeaseManager,
    }

    fn harness(retry_defaults: RetryPolicy) -> Harness {
        let store = SqliteStore::in_memory().expect("store");
        let clock = ManualClock::default();
        let manager = LeaseManager::new(
            store.clone(),
            Arc::new(LogBus::new()),
            Arc::new(clock.clone()),
            LeaseConfig::default(),
            retry_defaults,
        );
        Harness {
            store,
            clock,
            manager,
        }
    }

    fn queued_run(store: &SqliteStore, now: DateTime<Utc>) -> Run {
        let project = store
            .create_project("atlas", None, ProjectQuota::default())
            .expect("project");
        let wi = store
            .create_work_item(project.id, "deploy", None)
            .expect("work item");
        store.with_tx(|tx| insert_run(tx, wi.id, now)).expect("run")
    }

    #[test]
    fn claim_grants_and_marks_running() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        match h.manager.claim(run.id, "agent-a", Some(60)).expect("claim") {
            ClaimOutcome::Granted { run } => {
                assert_eq!(run.state, RunState::Running);
                assert_eq!(run.claimed_by.as_deref(), Some("agent-a"));
                assert!(run.started_at.is_some());
                assert_eq!(run.attempt, 1);
            }
            ClaimOutcome::Busy { .. } => panic!("expected grant"),
        }
    }

    #[test]
    fn second_claim_is_busy_until_expiry() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(60)).expect("claim");
        match h.manager.claim(run.id, "agent-b", Some(60)).expect("claim") {
            ClaimOutcome::Busy { claimed_by, .. } => assert_eq!(claimed_by, "agent-a"),
            ClaimOutcome::Granted { .. } => panic!("expected busy"),
        }
    }

    #[test]
    fn expired_lease_is_reclaimable_by_another_agent() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(2)).expect("claim");
        h.clock.advance(Duration::seconds(3));
        match h.manager.claim(run.id, "agent-b", Some(60)).expect("claim") {
            ClaimOutcome::Granted { run } => {
                assert_eq!(run.claimed_by.as_deref(), Some("agent-b"));
                assert_eq!(run.attempt, 2);
            }
            ClaimOutcome::Busy { .. } => panic!("expected reclaim"),
        }
    }

    #[test]
    fn heartbeat_extends_and_rejects_non_holder() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(60)).expect("claim");
        match h
            .manager
            .heartbeat(run.id, "agent-a", Some(120))
            .expect("heartbeat")
        {
            HeartbeatOutcome::Ok { claim_expires_at } => {
                assert_eq!(claim_expires_at, h.clock.now() + Duration::seconds(120));
            }
            HeartbeatOutcome::Lost => panic!("holder heartbeat must succeed"),
        }
        assert!(matches!(
            h.manager
                .heartbeat(run.id, "agent-b", Some(60))
                .expect("heartbeat"),
            HeartbeatOutcome::Lost
        ));
    }

    #[test]
    fn expire_scan_requeues_and_increments_attempt() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(2)).expect("claim");
        h.clock.advance(Duration::seconds(3));
        let outcome = h.manager.expire_scan().expect("scan");
        assert_eq!(outcome.requeued.len(), 1);
        assert_eq!(outcome.failed.len(), 0);
        let reloaded = h.store.get_run(run.id).expect("run");
        assert_eq!(reloaded.state, RunState::Queued);
        assert_eq!(reloaded.attempt, 2);
        assert!(reloaded.claimed_by.is_none());
        // The reclaim leaves a system log line behind.
        let logs = h.store.list_logs(run.id).expect("logs");
        assert!(logs.iter().any(|l| l.stream == LogStream::System
            && l.text.contains("requeued")));
    }

    #[test]
    fn expire_scan_fails_run_once_budget_is_exhausted() {
        let h = harness(RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        });
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(2)).expect("claim");
        h.clock.advance(Duration::seconds(3));
        let outcome = h.manager.expire_scan().expect("scan");
        assert_eq!(outcome.requeued.len(), 0);
        assert_eq!(outcome.failed.len(), 1);
        let reloaded = h.store.get_run(run.id).expect("run");
        assert_eq!(reloaded.state, RunState::Failed);
        assert!(reloaded.finished_at.is_some());
    }

    #[test]
    fn release_rejects_wrong_holder_and_terminal_rerelease() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(60)).expect("claim");
        let err = h
            .manager
            .release(run.id, Some("agent-b"), RunState::Succeeded)
            .expect_err("wrong holder");
        assert!(matches!(err, RuntimeError::Conflict(_)));
        let released = h
            .manager
            .release(run.id, Some("agent-a"), RunState::Succeeded)
            .expect("release");
        assert_eq!(released.state, RunState::Succeeded);
        assert!(released.finished_at.is_some());
        let err = h
            .manager
            .release(run.id, None, RunState::Cancelled)
            .expect_err("terminal");
        assert!(matches!(err, RuntimeError::Conflict(_)));
    }

    #[test]
    fn claim_on_terminal_run_is_a_conflict() {
        let h = harness(RetryPolicy::default());
        let run = queued_run(&h.store, h.clock.now());
        h.manager.claim(run.id, "agent-a", Some(60)).expect("claim");
        h.manager
            .release(run.id, Some("agent-a"), RunState::Succeeded)
            .expect("release");
        let err = h
            .manager
            .claim(run.id, "agent-b", Some(60))
            .expect_err("terminal");
        assert!(matches!(err, RuntimeError::Conflict(_)));
    }
}
