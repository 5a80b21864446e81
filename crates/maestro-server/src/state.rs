//! Server context threaded through every handler. Built once at
//! startup; no ambient globals.

use std::sync::Arc;

use maestro_runtime::{
    ApprovalGate, Clock, InfoRequestChannel, LeaseConfig, LeaseManager, LogBus, Result,
    RunLifecycle, Scheduler, SqliteStore, SystemClock,
};

use crate::config::Config;
use crate::middleware::RateLimiter;
use crate::secrets::ResponseSealer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SqliteStore,
    pub bus: Arc<LogBus>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<Scheduler>,
    pub lease: Arc<LeaseManager>,
    pub lifecycle: Arc<RunLifecycle>,
    pub info: Arc<InfoRequestChannel>,
    pub limiter: Arc<RateLimiter>,
    pub sealer: Option<Arc<ResponseSealer>>,
}

impl AppState {
    pub fn build(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config.database_url)?;
        Ok(Self::assemble(config, store, Arc::new(SystemClock)))
    }

    /// Wire the component graph over an existing store and clock; the
    /// tests use this with `:memory:` stores and a manual clock.
    pub fn assemble(config: Config, store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        let bus = Arc::new(LogBus::new());
        let retry_defaults = config.retry_policy();
        let gate = ApprovalGate::new(config.require_approval);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            gate,
            retry_defaults,
            clock.clone(),
        ));
        let lease = Arc::new(LeaseManager::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            LeaseConfig {
                default_ttl_seconds: config.default_claim_ttl_seconds,
            },
            retry_defaults,
        ));
        let lifecycle = Arc::new(RunLifecycle::new(
            store.clone(),
            bus.clone(),
            retry_defaults,
            clock.clone(),
        ));
        let info = Arc::new(InfoRequestChannel::new(store.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
        let sealer = config
            .secret_key
            .as_deref()
            .map(|secret| Arc::new(ResponseSealer::new(secret)));
        Self {
            config: Arc::new(config),
            store,
            bus,
            clock,
            scheduler,
            lease,
            lifecycle,
            info,
            limiter,
            sealer,
        }
    }
}
