//! Per-project run-admission quota over a rolling window.
//!
//! A "run start" is the creation of a Run row, so retries and explicit
//! starts count. Capacity returns as soon as the window slides past the
//! earliest recorded start; there is no penalty for a denied entry, it
//! simply stays queued for a later tick.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::models::Project;
use crate::store::count_run_starts_since;

#[derive(Clone, Copy, Debug, Default)]
pub struct QuotaMeter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Admitted { remaining: Option<i64> },
    Exhausted,
}

impl QuotaDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

impl QuotaMeter {
    /// Admission check, run inside the promoting transaction so the
    /// window count and the run insert are atomic.
    pub(crate) fn admit(
        &self,
        conn: &Connection,
        project: &Project,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        if project.quota.max_runs <= 0 {
            return Ok(QuotaDecision::Admitted { remaining: None });
        }
        let cutoff = now - Duration::seconds(project.quota.window_seconds);
        let started = count_run_starts_since(conn, project.id, cutoff)?;
        if started >= project.quota.max_runs {
            return Ok(QuotaDecision::Exhausted);
        }
        Ok(QuotaDecision::Admitted {
            remaining: Some(project.quota.max_runs - started - 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectQuota;
    use crate::store::{insert_run, SqliteStore};

    fn seeded(store: &SqliteStore, quota: ProjectQuota) -> (Project, i64) {
        let project = store
            .create_project("atlas", None, quota)
            .expect("project");
        let wi = store
            .create_work_item(project.id, "deploy", None)
            .expect("work item");
        (project, wi.id)
    }

    #[test]
    fn zero_max_runs_means_unlimited() {
        let store = SqliteStore::in_memory().expect("store");
        let (project, wi) = seeded(
            &store,
            ProjectQuota {
                window_seconds: 60,
                max_runs: 0,
            },
        );
        let now = Utc::now();
        for _ in 0..10 {
            store.with_tx(|tx| insert_run(tx, wi, now)).expect("run");
        }
        let decision = store
            .with_conn(|conn| QuotaMeter.admit(conn, &project, now))
            .expect("admit");
        assert_eq!(decision, QuotaDecision::Admitted { remaining: None });
    }

    #[test]
    fn window_fills_and_then_slides_open() {
        let store = SqliteStore::in_memory().expect("store");
        let (project, wi) = seeded(
            &store,
            ProjectQuota {
                window_seconds: 60,
                max_runs: 2,
            },
        );
        let now = Utc::now();
        store.with_tx(|tx| insert_run(tx, wi, now)).expect("r1");
        store
            .with_tx(|tx| insert_run(tx, wi, now + Duration::seconds(10)))
            .expect("r2");

        let at_capacity = store
            .with_conn(|conn| QuotaMeter.admit(conn, &project, now + Duration::seconds(20)))
            .expect("admit");
        assert_eq!(at_capacity, QuotaDecision::Exhausted);

        // 61s after the first start the window has slid past it.
        let reopened = store
            .with_conn(|conn| QuotaMeter.admit(conn, &project, now + Duration::seconds(61)))
            .expect("admit");
        assert_eq!(reopened, QuotaDecision::Admitted { remaining: Some(0) });
    }

    #[test]
    fn remaining_counts_down() {
        let store = SqliteStore::in_memory().expect("store");
        let (project, wi) = seeded(
            &store,
            ProjectQuota {
                window_seconds: 3600,
                max_runs: 3,
            },
        );
        let now = Utc::now();
        let fresh = store
            .with_conn(|conn| QuotaMeter.admit(conn, &project, now))
            .expect("admit");
        assert_eq!(fresh, QuotaDecision::Admitted { remaining: Some(2) });
        store.with_tx(|tx| insert_run(tx, wi, now)).expect("run");
        let after_one = store
            .with_conn(|conn| QuotaMeter.admit(conn, &project, now))
            .expect("admit");
        assert_eq!(after_one, QuotaDecision::Admitted { remaining: Some(1) });
    }
}
