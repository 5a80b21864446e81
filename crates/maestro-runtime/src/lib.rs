//! Job lifecycle engine for the maestro control plane.
//!
//! This crate decides what runs next, where, and under which
//! guarantees: a dependency-aware scheduler over a persistent queue, a
//! claim/heartbeat lease manager with TTL reclaim, a run state machine
//! with retry backoff, approval and quota admission gates, an
//! info-request side channel, and an in-process log/step fan-out bus.
//! The HTTP surface lives in `maestro-server`.

pub mod approval;
pub mod bus;
pub mod clock;
pub mod error;
pub mod info;
pub mod lease;
pub mod lifecycle;
pub mod models;
pub mod quota;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use approval::ApprovalGate;
pub use bus::{LogBus, RunEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, RuntimeError};
pub use info::InfoRequestChannel;
pub use lease::{ClaimOutcome, ExpireScanOutcome, HeartbeatOutcome, LeaseConfig, LeaseManager};
pub use lifecycle::{CompletionOutcome, RetryScheduled, RunLifecycle};
pub use models::{
    Agent, ApprovalRequest, ApprovalState, InfoKey, InfoRequest, InfoRequestState, LogEntry,
    LogStream, Project, ProjectQuota, QueueEntry, QueueEntryState, Run, RunState, RunStep,
    StepStatus, StoredResponse, WorkItem, WorkItemPolicy,
};
pub use quota::{QuotaDecision, QuotaMeter};
pub use retry::RetryPolicy;
pub use scheduler::{Promotion, Scheduler, TickSummary};
pub use store::{EntityCounts, ProjectUsage, SqliteStore};
