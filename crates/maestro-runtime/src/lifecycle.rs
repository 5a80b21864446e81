//! Run lifecycle: log and step ingestion, completion, and failure
//! re-queue.
//!
//! Completion releases the lease and, when the attempt failed with
//! budget remaining, schedules the retry queue entry in the same
//! transaction. Log and step writes persist first and fan out on the
//! bus only after commit, so subscribers never see an event the store
//! did not accept. Transient store failures are retried a bounded
//! number of times before surfacing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::bus::{LogBus, RunEvent};
use crate::clock::Clock;
use crate::error::{map_sqlite_err, Result, RuntimeError};
use crate::lease::release_in_tx;
use crate::models::{LogEntry, LogStream, Run, RunState, RunStep, StepStatus};
use crate::retry::RetryPolicy;
use crate::store::{
    append_log_entry, dt_to_ms, insert_queue_entry, run_row, step_row, work_item_row, SqliteStore,
};

const TRANSIENT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct RetryScheduled {
    pub queue_entry_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub next_attempt: u32,
}

#[derive(Clone, Debug)]
pub struct CompletionOutcome {
    pub run: Run,
    pub retry: Option<RetryScheduled>,
}

pub struct RunLifecycle {
    store: SqliteStore,
    bus: Arc<LogBus>,
    retry_defaults: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RunLifecycle {
    pub fn new(
        store: SqliteStore,
        bus: Arc<LogBus>,
        retry_defaults: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            retry_defaults,
            clock,
        }
    }

    fn with_retries<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < TRANSIENT_ATTEMPTS => {
                    tracing::warn!(%err, attempt, "transient store failure; retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Persist a log line and fan it out. The sequence number is
    /// assigned under the store transaction, so subscribers see the
    /// same total order the table records.
    pub fn append_log(&self, run_id: i64, stream: LogStream, text: &str) -> Result<LogEntry> {
        let now = self.clock.now();
        let entry = self.with_retries(|| {
            self.store.with_tx(|tx| {
                if run_row(tx, run_id)?.is_none() {
                    return Err(RuntimeError::not_found(format!("run {run_id} not found")));
                }
                append_log_entry(tx, run_id, stream, text, now)
            })
        })?;
        self.bus.publish(RunEvent::from_log(&entry));
        Ok(entry)
    }

    /// Create a step at the next index. Duplicate indexes conflict and
    /// gaps are rejected, which keeps `idx` a dense prefix of the
    /// naturals per run.
    pub fn create_step(&self, run_id: i64, idx: u32, name: &str) -> Result<RunStep> {
        if name.trim().is_empty() {
            return Err(RuntimeError::validation("step name must not be empty"));
        }
        let step = self.with_retries(|| {
            self.store.with_tx(|tx| {
                let run = run_row(tx, run_id)?
                    .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
                if run.state.is_terminal() {
                    return Err(RuntimeError::conflict(format!(
                        "run {run_id} is terminal: {}",
                        run.state.as_str()
                    )));
                }
                let count: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM run_steps WHERE run_id = ?1",
                        rusqlite::params![run_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| map_sqlite_err("count steps", e))?;
                if (idx as i64) < count {
                    return Err(RuntimeError::conflict(format!(
                        "step idx {idx} already exists for run {run_id}"
                    )));
                }
                if (idx as i64) > count {
                    return Err(RuntimeError::validation(format!(
                        "step idx {idx} would leave a gap; next idx is {count}"
                    )));
                }
                tx.execute(
                    "INSERT INTO run_steps (run_id, idx, name, status) VALUES (?1, ?2, ?3, 'pending')",
                    rusqlite::params![run_id, idx, name],
                )
                .map_err(|e| map_sqlite_err("insert step", e))?;
                step_row(tx, tx.last_insert_rowid())?
                    .ok_or_else(|| RuntimeError::internal("step vanished after insert"))
            })
        })?;
        self.bus.publish(RunEvent::from_step(&step));
        Ok(step)
    }

    pub fn update_step(
        &self,
        step_id: i64,
        status: Option<StepStatus>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        metadata: Option<Value>,
    ) -> Result<RunStep> {
        let metadata_text = match &metadata {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| RuntimeError::validation(format!("invalid metadata: {e}")))?,
            ),
            None => None,
        };
        let step = self.with_retries(|| {
            self.store.with_tx(|tx| {
                if step_row(tx, step_id)?.is_none() {
                    return Err(RuntimeError::not_found(format!("step {step_id} not found")));
                }
                tx.execute(
                    "UPDATE run_steps SET
                        status = COALESCE(?2, status),
                        started_at_ms = COALESCE(?3, started_at_ms),
                        finished_at_ms = COALESCE(?4, finished_at_ms),
                        metadata = COALESCE(?5, metadata)
                     WHERE id = ?1",
                    rusqlite::params![
                        step_id,
                        status.map(|s| s.as_str()),
                        started_at.map(dt_to_ms),
                        finished_at.map(dt_to_ms),
                        metadata_text.as_deref(),
                    ],
                )
                .map_err(|e| map_sqlite_err("update step", e))?;
                step_row(tx, step_id)?
                    .ok_or_else(|| RuntimeError::internal("step vanished after update"))
            })
        })?;
        self.bus.publish(RunEvent::from_step(&step));
        Ok(step)
    }

    /// Terminal completion. On failure with retry budget remaining, the
    /// retry queue entry is created atomically with the release; the
    /// failed run itself stays failed forever.
    pub fn complete(
        &self,
        run_id: i64,
        success: bool,
        agent_id: Option<&str>,
    ) -> Result<CompletionOutcome> {
        let now = self.clock.now();
        let final_state = if success {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        let (outcome, logs) = self.with_retries(|| {
            self.store.with_tx(|tx| {
                let (run, mut logs) = release_in_tx(tx, run_id, agent_id, final_state, now)?;
                let mut retry = None;
                if !success {
                    let work_item = work_item_row(tx, run.work_item_id)?.ok_or_else(|| {
                        RuntimeError::internal(format!(
                            "run {run_id} references missing work item {}",
                            run.work_item_id
                        ))
                    })?;
                    let policy = self.retry_defaults.for_work_item(&work_item);
                    if policy.allows_retry(run.attempt) {
                        let delay = policy.delay_seconds(run.attempt);
                        let scheduled_for = now + Duration::milliseconds((delay * 1000.0) as i64);
                        let entry = insert_queue_entry(
                            tx,
                            run.work_item_id,
                            None,
                            0,
                            scheduled_for,
                            now,
                        )?;
                        logs.push(append_log_entry(
                            tx,
                            run_id,
                            LogStream::System,
                            &format!(
                                "failed on attempt {}; retry scheduled in {delay:.1}s",
                                run.attempt
                            ),
                            now,
                        )?);
                        retry = Some(RetryScheduled {
                            queue_entry_id: entry.id,
                            scheduled_for,
                            next_attempt: run.attempt + 1,
                        });
                    } else {
                        logs.push(append_log_entry(
                            tx,
                            run_id,
                            LogStream::System,
                            &format!("failed on attempt {}; retry budget exhausted", run.attempt),
                            now,
                        )?);
                    }
                }
                Ok((CompletionOutcome { run, retry }, logs))
            })
        })?;
        for entry in &logs {
            self.bus.publish(RunEvent::from_log(entry));
        }
        Ok(outcome)
    }

    /// Operator cancellation: terminal, never retried.
    pub fn cancel(&self, run_id: i64) -> Result<Run> {
        let now = self.clock.now();
        let (run, logs) = self.with_retries(|| {
            self.store
                .with_tx(|tx| release_in_tx(tx, run_id, None, RunState::Cancelled, now))
        })?;
        for entry in &logs {
            self.bus.publish(RunEvent::from_log(entry));
        }
        Ok(run)
    }
}
