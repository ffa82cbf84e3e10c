//! Resource registry: local mirror of hypervisor inventory.
//!
//! `sync()` polls the hypervisor and replaces the stored snapshot. API
//! handlers read only from the store and never trigger a sync themselves.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::hypervisor::Hypervisor;
use super::store::{Database, InventoryDiff};
use super::types::*;

/// Lowest vmid Proxmox hands out.
pub const MIN_VMID: u32 = 100;

pub struct Registry {
    db: Database,
    hypervisor: Arc<dyn Hypervisor>,
}

impl Registry {
    pub fn new(db: Database, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { db, hypervisor }
    }

    /// Pull nodes and resources from the hypervisor and replace the mirror.
    ///
    /// Nothing is written unless both inventory calls succeed, so a flaky
    /// hypervisor never wipes the local view.
    pub async fn sync(&self) -> Result<InventoryDiff> {
        let nodes = self.hypervisor.get_nodes().await?;
        let resources = self.hypervisor.get_resources().await?;
        let diff = self.db.replace_inventory(&nodes, &resources, Utc::now())?;

        for r in &diff.removed_resources {
            info!(resource = %r, "resource disappeared from hypervisor, removed");
        }
        for n in &diff.removed_nodes {
            info!(node = %n, "node disappeared from hypervisor, removed");
        }
        if diff.cascaded_whitelist > 0 {
            warn!(
                count = diff.cascaded_whitelist,
                "whitelist entries removed with their targets"
            );
        }
        Ok(diff)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.db.list_nodes()
    }

    pub fn get_node(&self, name: &str) -> Result<Node> {
        self.db
            .get_node(name)?
            .ok_or_else(|| Error::not_found("node", name))
    }

    pub fn list_resources(&self) -> Result<Vec<Resource>> {
        self.db.list_resources()
    }

    pub fn get_resource(&self, r: &ResourceRef) -> Result<Resource> {
        self.db
            .get_resource(r)?
            .ok_or_else(|| Error::not_found("resource", r))
    }

    /// Find by vmid, narrowing by node when given. Without a node the vmid
    /// must be unambiguous.
    pub fn find_resource(&self, vmid: u32, node: Option<&str>) -> Result<Resource> {
        if let Some(node) = node {
            return self.get_resource(&ResourceRef::new(vmid, node));
        }
        let mut matches = self.db.resources_by_vmid(vmid)?;
        match matches.len() {
            0 => Err(Error::not_found("resource", vmid)),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::Validation(format!(
                "vmid {} exists on several nodes; specify node",
                vmid
            ))),
        }
    }

    pub fn vmid_in_use(&self, vmid: u32) -> Result<bool> {
        Ok(!self.db.resources_by_vmid(vmid)?.is_empty())
    }

    /// Smallest vmid above every known one (never below `MIN_VMID`).
    pub fn suggest_vmid(&self) -> Result<u32> {
        Ok(match self.db.max_vmid()? {
            Some(max) => max.saturating_add(1).max(MIN_VMID),
            None => MIN_VMID,
        })
    }

    /// Record a status confirmed by a completed lifecycle operation.
    pub fn mark_status(&self, r: &ResourceRef, status: ResourceStatus) -> Result<()> {
        if !self.db.set_resource_status(r, status)? {
            warn!(resource = %r, "status update for unknown resource ignored");
        }
        Ok(())
    }

    /// Record a resource created by a lifecycle operation ahead of the next sync.
    pub fn insert(&self, resource: &Resource) -> Result<()> {
        self.db.upsert_resource(resource)
    }

    /// Remove a resource; its whitelist entry is removed in the same transaction.
    pub fn remove(&self, r: &ResourceRef) -> Result<()> {
        if !self.db.delete_resource(r)? {
            return Err(Error::not_found("resource", r));
        }
        info!(resource = %r, "resource removed");
        Ok(())
    }

    /// Note a service a deploy installed into `r`.
    pub fn record_service(
        &self,
        r: &ResourceRef,
        service_name: &str,
        service_type: &str,
    ) -> Result<InstalledService> {
        let service = self
            .db
            .insert_service(r, service_name, service_type, Utc::now())?;
        info!(resource = %r, service = %service.service_name, kind = %service.service_type, "service installed");
        Ok(service)
    }

    /// Installed services of the resource `vmid` resolves to.
    pub fn services_for(&self, vmid: u32, node: Option<&str>) -> Result<Vec<InstalledService>> {
        let resource = self.find_resource(vmid, node)?;
        self.db.services_for(&resource.reference())
    }

    pub fn last_sync_time(&self) -> Result<Option<chrono::DateTime<Utc>>> {
        self.db.last_sync_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hypervisor::testing::FakeHypervisor;
    use crate::domain::store::tests::{node, resource};
    use crate::error::RemoteErrorKind;

    fn registry(hv: Arc<FakeHypervisor>) -> Registry {
        Registry::new(Database::open_memory().unwrap(), hv)
    }

    #[tokio::test]
    async fn test_sync_mirrors_inventory() {
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1")],
            vec![resource(105, "pve1", "web-01"), resource(200, "pve1", "tmpl")],
        ));
        let reg = registry(hv.clone());

        let diff = reg.sync().await.unwrap();
        assert_eq!(diff.upserted_resources, 2);
        assert_eq!(reg.list_resources().unwrap().len(), 2);
        assert_eq!(reg.get_node("pve1").unwrap().status, NodeStatus::Online);
        assert!(reg.last_sync_time().unwrap().is_some());
        assert_eq!(reg.suggest_vmid().unwrap(), 201);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_previous_snapshot() {
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1")],
            vec![resource(105, "pve1", "web-01")],
        ));
        let reg = registry(hv.clone());
        reg.sync().await.unwrap();

        hv.fail("get_resources", RemoteErrorKind::Network, "connection refused");
        assert!(reg.sync().await.is_err());
        assert_eq!(reg.list_resources().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_drops_vanished_resources() {
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1")],
            vec![resource(105, "pve1", "web-01"), resource(106, "pve1", "db-01")],
        ));
        let reg = registry(hv.clone());
        reg.sync().await.unwrap();

        hv.set_resources(vec![resource(105, "pve1", "web-01")]);
        let diff = reg.sync().await.unwrap();
        assert_eq!(diff.removed_resources, vec![ResourceRef::new(106, "pve1")]);
        assert!(matches!(
            reg.get_resource(&ResourceRef::new(106, "pve1")),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_resource_requires_unambiguous_vmid() {
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1"), node("pve2")],
            vec![resource(105, "pve1", "a"), resource(105, "pve2", "b"), resource(106, "pve2", "c")],
        ));
        let reg = registry(hv);
        reg.sync().await.unwrap();

        assert_eq!(reg.find_resource(106, None).unwrap().name, "c");
        assert_eq!(reg.find_resource(105, Some("pve2")).unwrap().name, "b");
        assert!(matches!(reg.find_resource(105, None), Err(Error::Validation(_))));
        assert!(matches!(reg.find_resource(999, None), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_services_dropped_when_resource_vanishes() {
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1")],
            vec![resource(105, "pve1", "web-01"), resource(106, "pve1", "db-01")],
        ));
        let reg = registry(hv.clone());
        reg.sync().await.unwrap();
        reg.record_service(&ResourceRef::new(106, "pve1"), "db-01", "custom")
            .unwrap();
        assert_eq!(reg.services_for(106, None).unwrap().len(), 1);
        assert!(reg.services_for(105, Some("pve1")).unwrap().is_empty());

        hv.set_resources(vec![resource(105, "pve1", "web-01")]);
        reg.sync().await.unwrap();
        assert!(matches!(reg.services_for(106, None), Err(Error::NotFound { .. })));
        hv.set_resources(vec![resource(105, "pve1", "web-01"), resource(106, "pve1", "db-01")]);
        reg.sync().await.unwrap();
        assert!(reg.services_for(106, None).unwrap().is_empty());
    }

    #[test]
    fn test_suggest_vmid_on_empty_registry() {
        let reg = registry(Arc::new(FakeHypervisor::default()));
        assert_eq!(reg.suggest_vmid().unwrap(), MIN_VMID);
    }
}
