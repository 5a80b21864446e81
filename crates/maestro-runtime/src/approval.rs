//! Approval gate: blocks run admission for work items that have not
//! cleared review when the global policy is on.
//!
//! Approval is per work item and sticky across retries: one approved
//! request admits every later run, but any still-pending request keeps
//! the gate closed.

use rusqlite::{params, Connection};

use crate::error::{map_sqlite_err, Result};

#[derive(Clone, Copy, Debug)]
pub struct ApprovalGate {
    pub require_approval: bool,
}

impl ApprovalGate {
    pub fn new(require_approval: bool) -> Self {
        Self { require_approval }
    }

    /// Admission check, run inside the promoting transaction.
    pub(crate) fn admits(&self, conn: &Connection, work_item_id: i64) -> Result<bool> {
        if !self.require_approval {
            return Ok(true);
        }
        if has_approval_in_state(conn, work_item_id, "pending")? {
            return Ok(false);
        }
        has_approval_in_state(conn, work_item_id, "approved")
    }
}

fn has_approval_in_state(conn: &Connection, work_item_id: i64, state: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM approval_requests WHERE work_item_id = ?1 AND state = ?2",
            params![work_item_id, state],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite_err("count approvals", e))?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectQuota;
    use crate::store::SqliteStore;
    use chrono::Utc;

    fn seeded_work_item(store: &SqliteStore) -> i64 {
        let project = store
            .create_project("atlas", None, ProjectQuota::default())
            .expect("project");
        store
            .create_work_item(project.id, "deploy", None)
            .expect("work item")
            .id
    }

    #[test]
    fn gate_off_admits_everything() {
        let store = SqliteStore::in_memory().expect("store");
        let wi = seeded_work_item(&store);
        let gate = ApprovalGate::new(false);
        assert!(store.with_conn(|conn| gate.admits(conn, wi)).expect("admit"));
    }

    #[test]
    fn gate_on_blocks_without_any_approval() {
        let store = SqliteStore::in_memory().expect("store");
        let wi = seeded_work_item(&store);
        let gate = ApprovalGate::new(true);
        assert!(!store.with_conn(|conn| gate.admits(conn, wi)).expect("admit"));
    }

    #[test]
    fn pending_request_blocks_even_with_an_earlier_approval() {
        let store = SqliteStore::in_memory().expect("store");
        let wi = seeded_work_item(&store);
        let gate = ApprovalGate::new(true);
        let now = Utc::now();

        let first = store
            .create_approval_request(wi, None, now)
            .expect("request");
        store.decide_approval(first.id, true, now).expect("approve");
        assert!(store.with_conn(|conn| gate.admits(conn, wi)).expect("admit"));

        store
            .create_approval_request(wi, Some("second review"), now)
            .expect("second request");
        assert!(!store.with_conn(|conn| gate.admits(conn, wi)).expect("admit"));
    }

    #[test]
    fn rejected_request_does_not_admit() {
        let store = SqliteStore::in_memory().expect("store");
        let wi = seeded_work_item(&store);
        let gate = ApprovalGate::new(true);
        let now = Utc::now();
        let request = store
            .create_approval_request(wi, None, now)
            .expect("request");
        store
            .decide_approval(request.id, false, now)
            .expect("reject");
        assert!(!store.with_conn(|conn| gate.admits(conn, wi)).expect("admit"));
    }
}
