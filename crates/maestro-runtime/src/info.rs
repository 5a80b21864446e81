//! Info-request side channel: an agent holding a run lease asks the
//! user for named inputs (credentials, regions) without giving up the
//! run. The run keeps executing; blocking on the answer is the agent's
//! call.
//!
//! Responses arrive through the edge either as plaintext or as an
//! already-sealed blob; this module stores whichever it is given and
//! never touches a cipher itself.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Result, RuntimeError};
use crate::models::{InfoKey, InfoRequest, InfoRequestState, RunState, StoredResponse};
use crate::store::{
    info_request_row, insert_info_request, run_row, store_info_response, SqliteStore,
};

pub struct InfoRequestChannel {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl InfoRequestChannel {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Open a request against a run the agent currently holds.
    pub fn open(&self, run_id: i64, agent_id: &str, keys: Vec<InfoKey>) -> Result<InfoRequest> {
        if keys.is_empty() {
            return Err(RuntimeError::validation(
                "info request must declare at least one key",
            ));
        }
        if keys.iter().any(|key| key.name.trim().is_empty()) {
            return Err(RuntimeError::validation("info key names must not be empty"));
        }
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let run = run_row(tx, run_id)?
                .ok_or_else(|| RuntimeError::not_found(format!("run {run_id} not found")))?;
            if run.state != RunState::Running {
                return Err(RuntimeError::conflict(format!(
                    "run {run_id} is not running"
                )));
            }
            if run.claimed_by.as_deref() != Some(agent_id) {
                return Err(RuntimeError::conflict(format!(
                    "run {run_id} is not held by {agent_id}"
                )));
            }
            insert_info_request(tx, run_id, &keys, now)
        })
    }

    pub fn list(&self, run_id: i64) -> Result<Vec<InfoRequest>> {
        self.store.list_info_requests(run_id)
    }

    pub fn get(&self, id: i64) -> Result<InfoRequest> {
        self.store.get_info_request(id)
    }

    /// Record the user's answer. Only pending requests are answerable.
    pub fn respond(&self, id: i64, response: StoredResponse) -> Result<InfoRequest> {
        if let StoredResponse::Sealed { algo, .. } = &response {
            if algo.trim().is_empty() {
                return Err(RuntimeError::validation(
                    "sealed responses must carry an algorithm tag",
                ));
            }
        }
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let existing = info_request_row(tx, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("info request {id} not found")))?;
            if existing.state != InfoRequestState::Pending {
                return Err(RuntimeError::conflict(format!(
                    "info request {id} is {}",
                    existing.state.as_str()
                )));
            }
            store_info_response(tx, id, &response, now)?;
            info_request_row(tx, id)?
                .ok_or_else(|| RuntimeError::internal("info request vanished after respond"))
        })
    }

    pub fn cancel(&self, id: i64) -> Result<InfoRequest> {
        self.store.with_tx(|tx| {
            let existing = info_request_row(tx, id)?
                .ok_or_else(|| RuntimeError::not_found(format!("info request {id} not found")))?;
            if existing.state != InfoRequestState::Pending {
                return Err(RuntimeError::conflict(format!(
                    "info request {id} is {}",
                    existing.state.as_str()
                )));
            }
            tx.execute(
                "UPDATE info_requests SET state = 'cancelled' WHERE id = ?1",
                rusqlite::params![id],
            )
            .map_err(|e| crate::error::map_sqlite_err("cancel info request", e))?;
            info_request_row(tx, id)?
                .ok_or_else(|| RuntimeError::internal("info request vanished after cancel"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LogBus;
    use crate::clock::ManualClock;
    use crate::lease::{LeaseConfig, LeaseManager};
    use crate::models::ProjectQuota;
    use crate::retry::RetryPolicy;
    use crate::store::insert_run;

    fn key(name: &str) -> InfoKey {
        InfoKey {
            name: name.into(),
            label: None,
        }
    }

    struct Harness {
        channel: InfoRequestChannel,
        run_id: i64,
    }

    fn harness_with_claimed_run() -> Harness {
        let store = SqliteStore::in_memory().expect("store");
        let clock = ManualClock::default();
        let project = store
            .create_project("atlas", None, ProjectQuota::default())
            .expect("project");
        let wi = store
            .create_work_item(project.id, "deploy", None)
            .expect("work item");
        let run = store
            .with_tx(|tx| insert_run(tx, wi.id, clock.now()))
            .expect("run");
        let lease = LeaseManager::new(
            store.clone(),
            Arc::new(LogBus::new()),
            Arc::new(clock.clone()),
            LeaseConfig::default(),
            RetryPolicy::default(),
        );
        lease.claim(run.id, "agent-a", Some(60)).expect("claim");
        Harness {
            channel: InfoRequestChannel::new(store, Arc::new(clock)),
            run_id: run.id,
        }
    }

    #[test]
    fn open_requires_the_lease_holder() {
        let h = harness_with_claimed_run();
        let err = h
            .channel
            .open(h.run_id, "agent-b", vec![key("aws_region")])
            .expect_err("non-holder");
        assert!(matches!(err, RuntimeError::Conflict(_)));
        let request = h
            .channel
            .open(h.run_id, "agent-a", vec![key("aws_region"), key("aws_key")])
            .expect("open");
        assert_eq!(request.state, InfoRequestState::Pending);
        assert_eq!(request.keys.len(), 2);
    }

    #[test]
    fn open_rejects_empty_key_list() {
        let h = harness_with_claimed_run();
        let err = h
            .channel
            .open(h.run_id, "agent-a", Vec::new())
            .expect_err("empty keys");
        assert!(matches!(err, RuntimeError::Validation(_)));
    }

    #[test]
    fn respond_is_single_shot() {
        let h = harness_with_claimed_run();
        let request = h
            .channel
            .open(h.run_id, "agent-a", vec![key("token")])
            .expect("open");
        let answered = h
            .channel
            .respond(request.id, StoredResponse::Plain("{\"token\":\"t\"}".into()))
            .expect("respond");
        assert_eq!(answered.state, InfoRequestState::Answered);
        assert!(answered.answered_at.is_some());
        let err = h
            .channel
            .respond(request.id, StoredResponse::Plain("{}".into()))
            .expect_err("already answered");
        assert!(matches!(err, RuntimeError::Conflict(_)));
    }

    #[test]
    fn cancelled_request_cannot_be_answered() {
        let h = harness_with_claimed_run();
        let request = h
            .channel
            .open(h.run_id, "agent-a", vec![key("token")])
            .expect("open");
        let cancelled = h.channel.cancel(request.id).expect("cancel");
        assert_eq!(cancelled.state, InfoRequestState::Cancelled);
        let err = h
            .channel
            .respond(request.id, StoredResponse::Plain("{}".into()))
            .expect_err("cancelled");
        assert!(matches!(err, RuntimeError::Conflict(_)));
    }
}
