//! Dependency-aware scheduler: queue entries, promotion ticks, delayed
//! release, priorities, and the optional background tick loop.
//!
//! A tick is one transaction over the queue. Entries due at the tick
//! instant are considered in (priority DESC, enqueued_at ASC, id ASC)
//! order; each must pass the full admission predicate (dependency
//! satisfied, approval gate, project quota, no live run for the work
//! item) before its queue entry is consumed and a claimable run is
//! created. Passes repeat until a fixpoint so a promotion that unblocks
//! a later entry is picked up within the same tick.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::clock::Clock;
use crate::error::{map_sqlite_err, Result, RuntimeError};
use crate::models::{QueueEntry, Run, RunState};
use crate::quota::QuotaMeter;
use crate::retry::RetryPolicy;
use crate::store::{
    due_queue_entries, consume_queue_entry, insert_queue_entry, insert_run,
    most_recent_terminal_run_state, project_row, run_row, work_item_row, SqliteStore,
};

#[derive(Clone, Debug, Serialize)]
pub struct Promotion {
    pub queue_entry_id: i64,
    pub work_item_id: i64,
    pub run_id: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TickSummary {
    pub promoted: Vec<Promotion>,
    pub passes: u32,
}

pub struct Scheduler {
    store: SqliteStore,
    gate: ApprovalGate,
    quota: QuotaMeter,
    retry_defaults: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        store: SqliteStore,
        gate: ApprovalGate,
        retry_defaults: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gate,
            quota: QuotaMeter,
            retry_defaults,
            clock,
        }
    }

    /// Add a queue entry. Duplicates are allowed; fan-in is modelled by
    /// multiple entries pointing at the same dependency.
    pub fn enqueue(
        &self,
        work_item_id: i64,
        depends_on_work_item_id: Option<i64>,
        priority: i64,
        delay_seconds: i64,
    ) -> Result<QueueEntry> {
        if delay_seconds < 0 {
            return Err(RuntimeError::validation("delay_seconds must be >= 0"));
        }
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            if work_item_row(tx, work_item_id)?.is_none() {
                return Err(RuntimeError::not_found(format!(
                    "work item {work_item_id} not found"
                )));
            }
            if let Some(dep) = depends_on_work_item_id {
                if work_item_row(tx, dep)?.is_none() {
                    return Err(RuntimeError::not_found(format!(
                        "dependency work item {dep} not found"
                    )));
                }
            }
            insert_queue_entry(
                tx,
                work_item_id,
                depends_on_work_item_id,
                priority,
                now + Duration::seconds(delay_seconds),
                now,
            )
        })
    }

    pub fn requeue_work_item(
        &self,
        work_item_id: i64,
        priority: i64,
        delay_seconds: i64,
    ) -> Result<QueueEntry> {
        self.enqueue(work_item_id, None, priority, delay_seconds)
    }

    /// Re-enqueue a run's work item, optionally applying the work
    /// item's backoff curve at the run's attempt number.
    pub fn requeue_run(
        &self,
        run_id: i64,
        priority: i64,
        backoff: bool,
        delay_seconds: Option<i64>,
    ) -> Result<QueueEntry> {
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let run = run_row(tx, run_id)?
                .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
            let work_item = work_item_row(tx, run.work_item_id)?.ok_or_else(|| {
                RuntimeError::internal(format!(
                    "run {run_id} references missing work item {}",
                    run.work_item_id
                ))
            })?;
            let delay = if backoff {
                self.retry_defaults
                    .for_work_item(&work_item)
                    .delay_seconds(run.attempt)
            } else {
                delay_seconds.unwrap_or(0).max(0) as f64
            };
            insert_queue_entry(
                tx,
                run.work_item_id,
                None,
                priority,
                now + Duration::milliseconds((delay * 1000.0) as i64),
                now,
            )
        })
    }

    pub fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        self.store.list_queue()
    }

    /// One atomic scheduling pass. Deterministic for a given queue and
    /// clock reading.
    pub fn tick(&self) -> Result<TickSummary> {
        let now = self.clock.now();
        let summary = self.store.with_tx(|tx| {
            let mut summary = TickSummary::default();
            loop {
                summary.passes += 1;
                let mut promoted_this_pass = 0;
                for entry in due_queue_entries(tx, now)? {
                    if !self.entry_is_eligible(tx, &entry)? {
                        continue;
                    }
                    if !consume_queue_entry(tx, entry.id)? {
                        continue;
                    }
                    let run = insert_run(tx, entry.work_item_id, now)?;
                    summary.promoted.push(Promotion {
                        queue_entry_id: entry.id,
                        work_item_id: entry.work_item_id,
                        run_id: run.id,
                    });
                    promoted_this_pass += 1;
                }
                if promoted_this_pass == 0 {
                    break;
                }
            }
            Ok(summary)
        })?;
        if !summary.promoted.is_empty() {
            tracing::debug!(promoted = summary.promoted.len(), "scheduler tick");
        }
        Ok(summary)
    }

    fn entry_is_eligible(&self, tx: &Connection, entry: &QueueEntry) -> Result<bool> {
        let Some(work_item) = work_item_row(tx, entry.work_item_id)? else {
            // Orphaned entry; consume it so it stops surfacing.
            consume_queue_entry(tx, entry.id)?;
            return Ok(false);
        };
        if let Some(dep) = entry.depends_on_work_item_id {
            match most_recent_terminal_run_state(tx, dep)? {
                Some(RunState::Succeeded) => {}
                _ => return Ok(false),
            }
        }
        if !self.gate.admits(tx, work_item.id)? {
            return Ok(false);
        }
        let project = project_row(tx, work_item.project_id)?.ok_or_else(|| {
            RuntimeError::internal(format!(
                "work item {} references missing project {}",
                work_item.id, work_item.project_id
            ))
        })?;
        if !self
            .quota
            .admit(tx, &project, self.clock.now())?
            .is_admitted()
        {
            return Ok(false);
        }
        if has_live_run(tx, work_item.id)? {
            return Ok(false);
        }
        Ok(true)
    }

    /// Explicit start: apply the same admission predicate as a tick and
    /// create a claimable run immediately. Denials surface with
    /// machine-readable reasons rather than leaving a queue entry behind.
    pub fn start_work_item(&self, work_item_id: i64) -> Result<Run> {
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let work_item = work_item_row(tx, work_item_id)?.ok_or_else(|| {
                RuntimeError::not_found(format!("work item {work_item_id} not found"))
            })?;
            if has_live_run(tx, work_item_id)? {
                return Err(RuntimeError::conflict(format!(
                    "work item {work_item_id} already has an active run"
                )));
            }
            if !self.gate.admits(tx, work_item_id)? {
                return Err(RuntimeError::denied(
                    "approval_required",
                    format!("work item {work_item_id} is not approved"),
                ));
            }
            let project = project_row(tx, work_item.project_id)?.ok_or_else(|| {
                RuntimeError::internal(format!(
                    "work item {work_item_id} references missing project {}",
                    work_item.project_id
                ))
            })?;
            if !self.quota.admit(tx, &project, now)?.is_admitted() {
                return Err(RuntimeError::denied(
                    "quota_exhausted",
                    format!("project {} is over its run quota", project.id),
                ));
            }
            insert_run(tx, work_item_id, now)
        })
    }

    /// Background tick loop. Single-flight by construction; transient
    /// store errors are retried a bounded number of times per firing.
    pub async fn run_background(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs_f64(), "background scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("background scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    for attempt in 1..=3u32 {
                        match self.tick() {
                            Ok(_) => break,
                            Err(err) if err.is_transient() && attempt < 3 => {
                                tracing::warn!(%err, attempt, "transient tick failure; retrying");
                            }
                            Err(err) => {
                                tracing::error!(%err, "scheduler tick failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// A work item with a queued or running run must not gain a second one;
/// this is what keeps at-most-one-running claimable state per item.
fn has_live_run(conn: &Connection, work_item_id: i64) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM runs
             WHERE work_item_id = ?1 AND state IN ('queued', 'running')",
            rusqlite::params![work_item_id],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite_err("count live runs", e))?;
    Ok(count > 0)
}
