//! Dashboard counters, recomputed from the stores on every call.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;

use super::audit::AuditLog;
use super::executor::LifecycleExecutor;
use super::registry::Registry;
use super::scheduler::RestartScheduler;
use super::types::*;
use super::whitelist::WhitelistStore;

pub struct StatusAggregator {
    registry: Arc<Registry>,
    whitelist: Arc<WhitelistStore>,
    audit: Arc<AuditLog>,
    scheduler: Arc<RestartScheduler>,
    executor: Arc<LifecycleExecutor>,
}

impl StatusAggregator {
    pub fn new(
        registry: Arc<Registry>,
        whitelist: Arc<WhitelistStore>,
        audit: Arc<AuditLog>,
        scheduler: Arc<RestartScheduler>,
        executor: Arc<LifecycleExecutor>,
    ) -> Self {
        Self {
            registry,
            whitelist,
            audit,
            scheduler,
            executor,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<SystemStatus> {
        let resources = self.registry.list_resources()?;
        let nodes = self.registry.list_nodes()?;
        let (total_restarts, failed_restarts) = self.audit.restart_counts()?;

        Ok(SystemStatus {
            total_resources: resources.len() as u64,
            running_resources: resources
                .iter()
                .filter(|r| r.status == ResourceStatus::Running)
                .count() as u64,
            total_nodes: nodes.len() as u64,
            online_nodes: nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Online)
                .count() as u64,
            whitelisted_count: self.whitelist.count()?,
            last_sync_time: self.registry.last_sync_time()?,
            next_restart_time: self.scheduler.next_restart_time(now)?,
            total_restarts,
            failed_restarts,
            in_flight: self.executor.in_flight().len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::executor::tests::harness;
    use crate::domain::executor::Operation;

    #[tokio::test]
    async fn test_status_counts() {
        let h = harness().await;
        let whitelist = Arc::new(WhitelistStore::new(h.db.clone()));
        let scheduler = Arc::new(RestartScheduler::new(
            whitelist.clone(),
            h.audit.clone(),
            h.executor.clone(),
            DEFAULT_INTERVAL_HOURS,
        ));
        let status = StatusAggregator::new(
            h.registry.clone(),
            whitelist.clone(),
            h.audit.clone(),
            scheduler,
            h.executor.clone(),
        );

        let now = Utc::now();
        let s = status.status(now).unwrap();
        assert_eq!(s.total_resources, 2);
        assert_eq!(s.running_resources, 2);
        assert_eq!(s.total_nodes, 2);
        assert_eq!(s.online_nodes, 2);
        assert_eq!(s.whitelisted_count, 0);
        assert_eq!(s.next_restart_time, None);
        assert!(s.last_sync_time.is_some());

        whitelist
            .add(Target::resource(105, "pve1"), "alice", "", None)
            .unwrap();
        h.executor
            .execute(
                Operation::Stop(Target::resource(106, "pve2")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        h.executor.drain().await;

        let s = status.status(now).unwrap();
        assert_eq!(s.running_resources, 1);
        assert_eq!(s.whitelisted_count, 1);
        assert_eq!(s.next_restart_time, Some(now));
        assert_eq!(s.total_restarts, 0);
        assert_eq!(s.in_flight, 0);
    }
}
