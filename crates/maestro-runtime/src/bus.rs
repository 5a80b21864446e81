//! In-process fan-out of per-run log and step events.
//!
//! One bounded broadcast channel per run, created lazily on the first
//! subscribe or publish. Subscribers only see events published after
//! they attach; history lives in the store. Publishing never blocks: a
//! subscriber that falls more than the channel capacity behind observes
//! `Lagged` on its receiver and is expected to disconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::{LogEntry, LogStream, RunStep, StepStatus};

const DEFAULT_SUBSCRIBER_BACKLOG: usize = 256;

/// Event published for live subscribers of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Log {
        run_id: i64,
        seq: i64,
        timestamp: DateTime<Utc>,
        stream: LogStream,
        text: String,
    },
    Step {
        run_id: i64,
        idx: u32,
        name: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
}

impl RunEvent {
    pub fn from_log(entry: &LogEntry) -> Self {
        Self::Log {
            run_id: entry.run_id,
            seq: entry.seq,
            timestamp: entry.timestamp,
            stream: entry.stream,
            text: entry.text.clone(),
        }
    }

    pub fn from_step(step: &RunStep) -> Self {
        Self::Step {
            run_id: step.run_id,
            idx: step.idx,
            name: step.name.clone(),
            status: step.status,
            metadata: step.metadata.clone(),
        }
    }
}

pub struct LogBus {
    channels: Mutex<HashMap<i64, broadcast::Sender<RunEvent>>>,
    backlog: usize,
}

impl LogBus {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_SUBSCRIBER_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            backlog: backlog.max(1),
        }
    }

    /// Attach a live subscriber to a run. Events appended before this
    /// call are not replayed.
    pub fn subscribe(&self, run_id: i64) -> broadcast::Receiver<RunEvent> {
        let mut channels = self.channels.lock().expect("bus lock");
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.backlog).0)
            .subscribe()
    }

    /// Best-effort delivery to current subscribers; drops the channel
    /// once the last subscriber has gone away.
    pub fn publish(&self, event: RunEvent) {
        let run_id = match &event {
            RunEvent::Log { run_id, .. } | RunEvent::Step { run_id, .. } => *run_id,
        };
        let mut channels = self.channels.lock().expect("bus lock");
        if let Some(sender) = channels.get(&run_id) {
            if sender.send(event).is_err() || sender.receiver_count() == 0 {
                channels.remove(&run_id);
            }
        }
    }

    pub fn subscriber_count(&self, run_id: i64) -> usize {
        self.channels
            .lock()
            .expect("bus lock")
            .get(&run_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(run_id: i64, seq: i64) -> RunEvent {
        RunEvent::Log {
            run_id,
            seq,
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            text: format!("line {seq}"),
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_events_after_attach() {
        let bus = LogBus::new();
        bus.publish(log_event(1, 1));
        let mut rx = bus.subscribe(1);
        bus.publish(log_event(1, 2));
        match rx.recv().await.expect("event") {
            RunEvent::Log { seq, .. } => assert_eq!(seq, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runs_are_isolated() {
        let bus = LogBus::new();
        let mut rx_one = bus.subscribe(1);
        let _rx_two = bus.subscribe(2);
        bus.publish(log_event(2, 1));
        bus.publish(log_event(1, 7));
        match rx_one.recv().await.expect("event") {
            RunEvent::Log { run_id, seq, .. } => {
                assert_eq!(run_id, 1);
                assert_eq!(seq, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag_after_backlog() {
        let bus = LogBus::with_backlog(4);
        let mut rx = bus.subscribe(1);
        for seq in 1..=10 {
            bus.publish(log_event(1, seq));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = LogBus::new();
        bus.publish(log_event(5, 1));
        assert_eq!(bus.subscriber_count(5), 0);
    }

    #[test]
    fn run_event_serializes_with_kind_tag() {
        let event = log_event(3, 1);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["kind"], "log");
        assert_eq!(json["stream"], "stdout");
    }
}
