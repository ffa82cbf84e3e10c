pub mod audit;
pub mod executor;
pub mod hypervisor;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;
pub mod whitelist;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

use self::audit::AuditLog;
use self::executor::LifecycleExecutor;
use self::hypervisor::Hypervisor;
use self::registry::Registry;
use self::scheduler::RestartScheduler;
use self::status::StatusAggregator;
use self::store::Database;
use self::whitelist::WhitelistStore;

/// The domain services, wired over one database and one hypervisor.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<Registry>,
    pub whitelist: Arc<WhitelistStore>,
    pub audit: Arc<AuditLog>,
    pub executor: Arc<LifecycleExecutor>,
    pub scheduler: Arc<RestartScheduler>,
    pub status: Arc<StatusAggregator>,
}

impl Services {
    pub fn new(db: Database, hypervisor: Arc<dyn Hypervisor>, config: &Config) -> Self {
        let registry = Arc::new(Registry::new(db.clone(), hypervisor.clone()));
        let whitelist = Arc::new(WhitelistStore::new(db.clone()));
        let audit = Arc::new(AuditLog::new(db));
        let executor = Arc::new(LifecycleExecutor::new(
            registry.clone(),
            audit.clone(),
            hypervisor,
            Duration::from_secs(config.executor.operation_timeout_secs),
        ));
        let scheduler = Arc::new(RestartScheduler::new(
            whitelist.clone(),
            audit.clone(),
            executor.clone(),
            config.scheduler.default_interval_hours,
        ));
        let status = Arc::new(StatusAggregator::new(
            registry.clone(),
            whitelist.clone(),
            audit.clone(),
            scheduler.clone(),
            executor.clone(),
        ));
        Self {
            registry,
            whitelist,
            audit,
            executor,
            scheduler,
            status,
        }
    }
}
