//! Lifecycle executor: runs one hypervisor operation per target as a
//! supervised background task, bracketed by a pending/terminal audit entry.
//!
//! `execute` validates, reserves the target, opens the log entry and returns
//! it immediately. The spawned task owns the rest: it calls the hypervisor
//! under a deadline, applies the confirmed state to the registry, closes
//! the log entry and releases the reservation.
//!
//! Clones and deploys also reserve their new vmid, which Proxmox requires
//! to be unique across the cluster.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

use super::audit::AuditLog;
use super::hypervisor::{CloneRequest, Hypervisor, Instance, PowerTarget};
use super::registry::{Registry, MIN_VMID};
use super::types::*;

/// Clone parameters. Without `source_node` the source vmid must be unique.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub source_vmid: u32,
    pub source_node: Option<String>,
    pub new_vmid: u32,
    pub target_node: String,
    pub hostname: Option<String>,
}

/// How a deploy's installed service is recorded. Unset fields fall back
/// to the new resource's name and the `custom` type.
#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
    pub name: Option<String>,
    pub service_type: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Operation {
    Start(Target),
    Stop(Target),
    Restart(Target),
    Clone(CloneSpec),
    Delete(ResourceRef),
    Deploy {
        clone: CloneSpec,
        commands: Vec<String>,
        service: ServiceSpec,
    },
}

impl Operation {
    pub fn action(&self) -> Action {
        match self {
            Operation::Start(_) => Action::Start,
            Operation::Stop(_) => Action::Stop,
            Operation::Restart(_) => Action::Restart,
            Operation::Clone(_) => Action::Clone,
            Operation::Delete(_) => Action::Delete,
            Operation::Deploy { .. } => Action::Deploy,
        }
    }
}

/// An operation resolved against the registry, ready to hand to the hypervisor.
#[derive(Debug, Clone)]
enum Plan {
    Power {
        action: Action,
        target: PowerTarget,
        resource: Option<ResourceRef>,
    },
    Clone {
        request: CloneRequest,
        name: String,
    },
    Delete(Instance),
    Deploy {
        request: CloneRequest,
        name: String,
        commands: Vec<String>,
        service_name: String,
        service_type: String,
    },
}

impl Plan {
    /// The vmid this plan creates, if any.
    fn new_vmid(&self) -> Option<u32> {
        match self {
            Plan::Clone { request, .. } | Plan::Deploy { request, .. } => Some(request.new_vmid),
            _ => None,
        }
    }
}

/// A reserved, in-progress operation.
#[derive(Debug, Clone, Serialize)]
pub struct InFlight {
    pub target_key: String,
    pub log_id: i64,
    pub action: Action,
}

#[derive(Default)]
struct Reserved {
    ops: HashMap<String, InFlight>,
    vmids: HashSet<u32>,
}

pub struct LifecycleExecutor {
    registry: Arc<Registry>,
    audit: Arc<AuditLog>,
    hypervisor: Arc<dyn Hypervisor>,
    reserved: Mutex<Reserved>,
    tasks: Mutex<JoinSet<()>>,
    operation_timeout: Duration,
}

impl LifecycleExecutor {
    pub fn new(
        registry: Arc<Registry>,
        audit: Arc<AuditLog>,
        hypervisor: Arc<dyn Hypervisor>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            audit,
            hypervisor,
            reserved: Mutex::new(Reserved::default()),
            tasks: Mutex::new(JoinSet::new()),
            operation_timeout,
        }
    }

    /// Dispatch `op` and return its pending log entry.
    ///
    /// Fails without side effects when the target is unknown (`NotFound`),
    /// a clone would reuse a vmid (`Duplicate`) or the target or new vmid
    /// already has an operation running (`InFlight`). Nothing here awaits,
    /// so a reservation always reaches its task.
    pub async fn execute(
        self: &Arc<Self>,
        op: Operation,
        triggered_by: &str,
        trigger_type: TriggerType,
    ) -> Result<RestartLogEntry> {
        let action = op.action();
        let (target, resource_name, plan) = self.prepare(op)?;
        let key = target.key();
        let new_vmid = plan.new_vmid();

        let entry = {
            let mut reserved = self.reserved.lock();
            if reserved.ops.contains_key(&key) || self.audit.pending_for(&target)?.is_some() {
                return Err(Error::InFlight { target: key });
            }
            if let Some(vmid) = new_vmid {
                if reserved.vmids.contains(&vmid) {
                    return Err(Error::InFlight {
                        target: format!("vmid:{}", vmid),
                    });
                }
                // a clone that finished after `prepare` has registered it
                if self.registry.vmid_in_use(vmid)? {
                    return Err(Error::duplicate("resource", vmid));
                }
            }
            let entry = self.audit.open(&NewLogEntry {
                target: target.clone(),
                resource_name,
                action,
                trigger_type,
                triggered_by: triggered_by.to_string(),
            })?;
            reserved.ops.insert(
                key.clone(),
                InFlight {
                    target_key: key.clone(),
                    log_id: entry.id,
                    action,
                },
            );
            if let Some(vmid) = new_vmid {
                reserved.vmids.insert(vmid);
            }
            entry
        };

        info!(
            log_id = entry.id,
            target = %target,
            action = %action,
            trigger = %trigger_type,
            triggered_by,
            "operation dispatched"
        );

        let reservation = Reservation {
            executor: Arc::clone(self),
            key,
            vmid: new_vmid,
        };
        let this = Arc::clone(self);
        let log_id = entry.id;
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _reservation = reservation;
            this.run(log_id, plan).await;
        });

        Ok(entry)
    }

    /// Operations currently running.
    pub fn in_flight(&self) -> Vec<InFlight> {
        let mut ops: Vec<InFlight> = self.reserved.lock().ops.values().cloned().collect();
        ops.sort_by_key(|op| op.log_id);
        ops
    }

    pub fn is_in_flight(&self, target: &Target) -> bool {
        self.reserved.lock().ops.contains_key(&target.key())
    }

    /// Wait for every dispatched operation to finish, including ones
    /// dispatched while draining.
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::replace(&mut *self.tasks.lock(), JoinSet::new());
            if tasks.is_empty() {
                return;
            }
            info!(pending = tasks.len(), "waiting for in-flight operations");
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "operation task failed to join");
                }
            }
        }
    }

    fn prepare(&self, op: Operation) -> Result<(Target, Option<String>, Plan)> {
        match op {
            Operation::Start(t) => self.prepare_power(Action::Start, t),
            Operation::Stop(t) => self.prepare_power(Action::Stop, t),
            Operation::Restart(t) => self.prepare_power(Action::Restart, t),
            Operation::Delete(r) => {
                let resource = self.registry.get_resource(&r)?;
                Ok((
                    Target::from(r),
                    Some(resource.name.clone()),
                    Plan::Delete(Instance::from(&resource)),
                ))
            }
            Operation::Clone(spec) => {
                let (target, request, name) = self.prepare_clone(&spec)?;
                Ok((target, Some(name.clone()), Plan::Clone { request, name }))
            }
            Operation::Deploy {
                clone,
                commands,
                service,
            } => {
                if commands.iter().all(|c| c.trim().is_empty()) {
                    return Err(Error::Validation(
                        "deploy requires at least one command".to_string(),
                    ));
                }
                let (target, request, name) = self.prepare_clone(&clone)?;
                let commands = commands
                    .into_iter()
                    .filter(|c| !c.trim().is_empty())
                    .collect();
                let service_name = non_blank(service.name).unwrap_or_else(|| name.clone());
                let service_type = non_blank(service.service_type)
                    .unwrap_or_else(|| CUSTOM_SERVICE_TYPE.to_string());
                Ok((
                    target,
                    Some(name.clone()),
                    Plan::Deploy {
                        request,
                        name,
                        commands,
                        service_name,
                        service_type,
                    },
                ))
            }
        }
    }

    fn prepare_power(&self, action: Action, target: Target) -> Result<(Target, Option<String>, Plan)> {
        match &target {
            Target::Resource { vmid, node } => {
                let resource = self.registry.get_resource(&ResourceRef::new(*vmid, node))?;
                let plan = Plan::Power {
                    action,
                    target: PowerTarget::Instance(Instance::from(&resource)),
                    resource: Some(resource.reference()),
                };
                Ok((target, Some(resource.name), plan))
            }
            Target::Node { name } => {
                let node = self.registry.get_node(name)?;
                let plan = Plan::Power {
                    action,
                    target: PowerTarget::Node(node.name.clone()),
                    resource: None,
                };
                Ok((target, Some(node.name), plan))
            }
        }
    }

    fn prepare_clone(&self, spec: &CloneSpec) -> Result<(Target, CloneRequest, String)> {
        if spec.new_vmid < MIN_VMID {
            return Err(Error::Validation(format!(
                "new vmid must be at least {}",
                MIN_VMID
            )));
        }
        let source = self
            .registry
            .find_resource(spec.source_vmid, spec.source_node.as_deref())?;
        self.registry.get_node(&spec.target_node)?;
        if self.registry.vmid_in_use(spec.new_vmid)? {
            return Err(Error::duplicate("resource", spec.new_vmid));
        }

        let hostname = non_blank(spec.hostname.clone());
        let name = hostname
            .clone()
            .unwrap_or_else(|| format!("{}-clone", source.name));
        let request = CloneRequest {
            source: Instance::from(&source),
            new_vmid: spec.new_vmid,
            target_node: spec.target_node.clone(),
            hostname,
        };
        Ok((
            Target::resource(spec.new_vmid, &spec.target_node),
            request,
            name,
        ))
    }

    async fn run(&self, log_id: i64, plan: Plan) {
        let started = std::time::Instant::now();
        let transcript = Mutex::new(String::new());
        let outcome = match tokio::time::timeout(
            self.operation_timeout,
            self.perform(&plan, &transcript),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed {
                error: Error::timeout("operation", self.operation_timeout.as_secs()).to_string(),
                output: take_output(&transcript),
            },
        };

        match &outcome {
            Outcome::Success { .. } => info!(
                log_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "operation succeeded"
            ),
            Outcome::Failed { error, .. } => warn!(
                log_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %error,
                "operation failed"
            ),
        }

        if let Err(e) = self.audit.complete(log_id, &outcome) {
            error!(log_id, error = %e, "failed to record operation outcome");
        }
    }

    /// Run the plan against the hypervisor and apply confirmed state.
    /// Command output accumulates in `transcript`.
    async fn perform(&self, plan: &Plan, transcript: &Mutex<String>) -> Outcome {
        match plan {
            Plan::Power {
                action,
                target,
                resource,
            } => {
                let (res, status) = match action {
                    Action::Start => (self.hypervisor.start(target).await, ResourceStatus::Running),
                    Action::Stop => (self.hypervisor.stop(target).await, ResourceStatus::Stopped),
                    _ => (self.hypervisor.restart(target).await, ResourceStatus::Running),
                };
                match res {
                    Ok(output) => {
                        if let Some(r) = resource {
                            self.record(self.registry.mark_status(r, status));
                        }
                        Outcome::Success { output }
                    }
                    Err(e) => failed(e, None),
                }
            }
            Plan::Delete(instance) => match self.hypervisor.delete(instance).await {
                Ok(output) => {
                    let r = ResourceRef::new(instance.vmid, &instance.node);
                    self.record(self.registry.remove(&r));
                    Outcome::Success { output }
                }
                Err(e) => failed(e, None),
            },
            Plan::Clone { request, name } => match self.hypervisor.clone_resource(request).await {
                Ok(output) => {
                    self.record_clone(request, name, ResourceStatus::Stopped);
                    Outcome::Success { output }
                }
                Err(e) => failed(e, None),
            },
            Plan::Deploy {
                request,
                name,
                commands,
                service_name,
                service_type,
            } => {
                if let Err(e) = self.deploy(request, name, commands, transcript).await {
                    return failed(e, take_output(transcript));
                }
                let r = ResourceRef::new(request.new_vmid, &request.target_node);
                self.record(
                    self.registry
                        .record_service(&r, service_name, service_type)
                        .map(|_| ()),
                );
                Outcome::Success {
                    output: take_output(transcript),
                }
            }
        }
    }

    /// Clone, start the clone, wait for it to accept commands, then run
    /// `commands` inside it in order.
    async fn deploy(
        &self,
        request: &CloneRequest,
        name: &str,
        commands: &[String],
        transcript: &Mutex<String>,
    ) -> Result<()> {
        self.hypervisor.clone_resource(request).await?;
        self.record_clone(request, name, ResourceStatus::Stopped);

        let instance = Instance {
            vmid: request.new_vmid,
            node: request.target_node.clone(),
            kind: request.source.kind,
        };
        self.hypervisor
            .start(&PowerTarget::Instance(instance.clone()))
            .await?;
        let r = ResourceRef::new(instance.vmid, &instance.node);
        self.record(self.registry.mark_status(&r, ResourceStatus::Running));

        self.hypervisor.wait_ready(&instance).await?;
        self.hypervisor
            .run_commands(&instance, commands, transcript)
            .await
    }

    fn record_clone(&self, request: &CloneRequest, name: &str, status: ResourceStatus) {
        let resource = Resource {
            vmid: request.new_vmid,
            name: name.to_string(),
            kind: request.source.kind,
            node: request.target_node.clone(),
            status,
            usage: Usage::default(),
            last_synced_at: Utc::now(),
        };
        self.record(self.registry.insert(&resource));
    }

    /// Registry updates are best effort; the next sync reconciles.
    fn record(&self, res: Result<()>) {
        if let Err(e) = res {
            warn!(error = %e, "registry update after operation failed");
        }
    }
}

fn failed(e: Error, output: Option<String>) -> Outcome {
    Outcome::Failed {
        error: e.to_string(),
        output,
    }
}

fn take_output(transcript: &Mutex<String>) -> Option<String> {
    Some(std::mem::take(&mut *transcript.lock())).filter(|o| !o.is_empty())
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Releases the target and any claimed vmid when the operation task ends,
/// even on panic.
struct Reservation {
    executor: Arc<LifecycleExecutor>,
    key: String,
    vmid: Option<u32>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut reserved = self.executor.reserved.lock();
        reserved.ops.remove(&self.key);
        if let Some(vmid) = self.vmid {
            reserved.vmids.remove(&vmid);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::hypervisor::testing::FakeHypervisor;
    use crate::domain::hypervisor::CommandOutput;
    use crate::domain::store::tests::{node, resource};
    use crate::domain::store::Database;
    use crate::domain::whitelist::WhitelistStore;
    use crate::error::RemoteErrorKind;

    pub(crate) struct Harness {
        pub db: Database,
        pub hv: Arc<FakeHypervisor>,
        pub registry: Arc<Registry>,
        pub audit: Arc<AuditLog>,
        pub executor: Arc<LifecycleExecutor>,
    }

    /// Two nodes, 105@pve1 "web-01" running and 106@pve2 "db-01" running.
    pub(crate) async fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(5)).await
    }

    pub(crate) async fn harness_with_timeout(timeout: Duration) -> Harness {
        let db = Database::open_memory().unwrap();
        let hv = Arc::new(FakeHypervisor::new(
            vec![node("pve1"), node("pve2")],
            vec![resource(105, "pve1", "web-01"), resource(106, "pve2", "db-01")],
        ));
        let registry = Arc::new(Registry::new(db.clone(), hv.clone()));
        registry.sync().await.unwrap();
        let audit = Arc::new(AuditLog::new(db.clone()));
        let executor = Arc::new(LifecycleExecutor::new(
            registry.clone(),
            audit.clone(),
            hv.clone(),
            timeout,
        ));
        Harness {
            db,
            hv,
            registry,
            audit,
            executor,
        }
    }

    fn deploy(commands: &[&str]) -> Operation {
        Operation::Deploy {
            clone: CloneSpec {
                source_vmid: 105,
                source_node: Some("pve1".into()),
                new_vmid: 201,
                target_node: "pve1".into(),
                hostname: Some("app-01".into()),
            },
            commands: commands.iter().map(|c| c.to_string()).collect(),
            service: ServiceSpec::default(),
        }
    }

    fn clone_to(source_vmid: u32, new_vmid: u32, target_node: &str) -> Operation {
        Operation::Clone(CloneSpec {
            source_vmid,
            source_node: None,
            new_vmid,
            target_node: target_node.into(),
            hostname: None,
        })
    }

    #[tokio::test]
    async fn test_restart_resolves_to_success() {
        let h = harness().await;
        let entry = h
            .executor
            .execute(
                Operation::Restart(Target::resource(105, "pve1")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        assert_eq!(entry.status, LogStatus::Pending);
        assert_eq!(entry.resource_name.as_deref(), Some("web-01"));

        h.executor.drain().await;
        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Success);
        assert!(done.completed_at.unwrap() >= done.started_at);
        assert_eq!(done.output.as_deref(), Some("UPID:105@pve1:reboot"));
        assert!(h.executor.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_is_logged_not_returned() {
        let h = harness().await;
        h.hv.fail("stop", RemoteErrorKind::Api, "VM is locked");
        let entry = h
            .executor
            .execute(
                Operation::Stop(Target::resource(105, "pve1")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        assert!(done.error_message.unwrap().contains("VM is locked"));
        let r = h.registry.get_resource(&ResourceRef::new(105, "pve1")).unwrap();
        assert_eq!(r.status, ResourceStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_updates_registry_status() {
        let h = harness().await;
        h.executor
            .execute(
                Operation::Stop(Target::resource(106, "pve2")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        h.executor.drain().await;
        let r = h.registry.get_resource(&ResourceRef::new(106, "pve2")).unwrap();
        assert_eq!(r.status, ResourceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_for_same_target_rejected() {
        let h = harness().await;
        h.hv.set_delay(Duration::from_millis(100));
        let target = Target::resource(105, "pve1");

        let first = h
            .executor
            .execute(Operation::Restart(target.clone()), "a", TriggerType::Manual)
            .await
            .unwrap();
        let second = h
            .executor
            .execute(Operation::Restart(target.clone()), "b", TriggerType::Manual)
            .await;
        assert!(matches!(second, Err(Error::InFlight { .. })));
        assert!(h.executor.is_in_flight(&target));
        assert_eq!(h.executor.in_flight()[0].log_id, first.id);

        // a different target is not blocked
        h.executor
            .execute(
                Operation::Restart(Target::resource(106, "pve2")),
                "c",
                TriggerType::Manual,
            )
            .await
            .unwrap();

        h.executor.drain().await;
        assert_eq!(h.hv.count("restart 105@pve1"), 1);
        let pending = h
            .audit
            .query(&LogFilter {
                status: Some(LogStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let h = harness_with_timeout(Duration::from_millis(20)).await;
        h.hv.set_delay(Duration::from_millis(500));
        let entry = h
            .executor
            .execute(
                Operation::Start(Target::node("pve1")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        assert!(done.error_message.unwrap().contains("timeout"));
        assert!(!h.executor.is_in_flight(&Target::node("pve1")));
    }

    #[tokio::test]
    async fn test_unknown_target_rejected_without_log() {
        let h = harness().await;
        let res = h
            .executor
            .execute(
                Operation::Restart(Target::resource(999, "pve1")),
                "alice",
                TriggerType::Manual,
            )
            .await;
        assert!(matches!(res, Err(Error::NotFound { .. })));
        assert!(h.audit.query(&LogFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_onto_existing_vmid_rejected() {
        let h = harness().await;
        let res = h
            .executor
            .execute(
                Operation::Clone(CloneSpec {
                    source_vmid: 105,
                    source_node: None,
                    new_vmid: 106,
                    target_node: "pve1".into(),
                    hostname: None,
                }),
                "alice",
                TriggerType::Manual,
            )
            .await;
        assert!(matches!(res, Err(Error::Duplicate { .. })));
        assert_eq!(h.hv.count("clone"), 0);
        assert_eq!(h.registry.list_resources().unwrap().len(), 2);
        assert!(h.audit.query(&LogFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_registers_new_resource() {
        let h = harness().await;
        let entry = h
            .executor
            .execute(
                Operation::Clone(CloneSpec {
                    source_vmid: 105,
                    source_node: None,
                    new_vmid: 150,
                    target_node: "pve2".into(),
                    hostname: None,
                }),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        assert_eq!(entry.target_key, "resource:150@pve2");
        h.executor.drain().await;

        let clone = h.registry.get_resource(&ResourceRef::new(150, "pve2")).unwrap();
        assert_eq!(clone.name, "web-01-clone");
        assert_eq!(clone.status, ResourceStatus::Stopped);
        assert_eq!(h.hv.calls(), vec!["clone 105->150@pve2"]);
    }

    #[tokio::test]
    async fn test_delete_cascades_whitelist() {
        let h = harness().await;
        let whitelist = WhitelistStore::new(h.db.clone());
        let entry = whitelist
            .add(Target::resource(105, "pve1"), "alice", "", None)
            .unwrap();

        h.executor
            .execute(
                Operation::Delete(ResourceRef::new(105, "pve1")),
                "alice",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        h.executor.drain().await;

        assert!(matches!(whitelist.get(entry.id), Err(Error::NotFound { .. })));
        assert!(h.registry.get_resource(&ResourceRef::new(105, "pve1")).is_err());
    }

    #[tokio::test]
    async fn test_deploy_stops_at_first_failing_command() {
        let h = harness().await;
        h.hv.script_command(
            "B",
            CommandOutput {
                exit_code: 2,
                stdout: "b-out".into(),
                stderr: "b-err".into(),
            },
        );
        let entry = h
            .executor
            .execute(deploy(&["A", "B", "C"]), "alice", TriggerType::Manual)
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        let output = done.output.unwrap();
        assert!(output.contains("ran A"));
        assert!(output.contains("b-out"));
        assert!(!output.contains("$ C"));
        assert_eq!(h.hv.count("exec"), 2);
        assert_eq!(
            h.hv.calls()[..2],
            ["clone 105->201@pve1".to_string(), "start 201@pve1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_deploy_success_keeps_transcript() {
        let h = harness().await;
        let entry = h
            .executor
            .execute(deploy(&["A", "", "C"]), "alice", TriggerType::Manual)
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Success);
        assert_eq!(done.output.as_deref(), Some("$ A\nran A\n$ C\nran C\n"));
        let r = h.registry.get_resource(&ResourceRef::new(201, "pve1")).unwrap();
        assert_eq!(r.name, "app-01");
        assert_eq!(r.status, ResourceStatus::Running);
        assert_eq!(
            h.hv.calls()[..4],
            [
                "clone 105->201@pve1".to_string(),
                "start 201@pve1".to_string(),
                "ready 201@pve1".to_string(),
                "exec 201@pve1 A".to_string(),
            ]
        );

        let services = h.registry.services_for(201, Some("pve1")).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_name, "app-01");
        assert_eq!(services[0].service_type, CUSTOM_SERVICE_TYPE);
    }

    #[tokio::test]
    async fn test_deploy_records_named_service() {
        let h = harness().await;
        let op = match deploy(&["A"]) {
            Operation::Deploy { clone, commands, .. } => Operation::Deploy {
                clone,
                commands,
                service: ServiceSpec {
                    name: Some("grow-node".into()),
                    service_type: Some("grow".into()),
                },
            },
            other => other,
        };
        h.executor.execute(op, "alice", TriggerType::Manual).await.unwrap();
        h.executor.drain().await;

        let services = h.registry.services_for(201, None).unwrap();
        assert_eq!(services[0].service_name, "grow-node");
        assert_eq!(services[0].service_type, "grow");
    }

    #[tokio::test]
    async fn test_deploy_stops_when_guest_never_becomes_ready() {
        let h = harness().await;
        h.hv.fail("ready", RemoteErrorKind::Timeout, "guest agent of 201 did not answer");
        let entry = h
            .executor
            .execute(deploy(&["A"]), "alice", TriggerType::Manual)
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        assert!(done.error_message.unwrap().contains("guest agent"));
        assert_eq!(h.hv.count("exec"), 0);
        assert!(h.registry.services_for(201, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_timeout_keeps_partial_output() {
        let h = harness_with_timeout(Duration::from_millis(300)).await;
        h.hv.slow_command("B", Duration::from_secs(5));
        let entry = h
            .executor
            .execute(deploy(&["A", "B", "C"]), "alice", TriggerType::Manual)
            .await
            .unwrap();
        h.executor.drain().await;

        let done = h.audit.get(entry.id).unwrap();
        assert_eq!(done.status, LogStatus::Failed);
        assert!(done.error_message.unwrap().contains("timeout"));
        let output = done.output.unwrap();
        assert!(output.contains("$ A\nran A\n"));
        assert!(output.ends_with("$ B\n"));
        assert!(h.registry.services_for(201, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_clones_cannot_share_new_vmid() {
        let h = harness().await;
        h.hv.set_delay(Duration::from_millis(100));

        h.executor
            .execute(clone_to(105, 150, "pve1"), "a", TriggerType::Manual)
            .await
            .unwrap();
        let second = h
            .executor
            .execute(clone_to(106, 150, "pve2"), "b", TriggerType::Manual)
            .await;
        assert!(matches!(second, Err(Error::InFlight { ref target }) if target == "vmid:150"));

        h.executor.drain().await;
        assert_eq!(h.hv.count("clone"), 1);

        // once the first clone lands the vmid is simply taken
        let third = h
            .executor
            .execute(clone_to(106, 150, "pve2"), "b", TriggerType::Manual)
            .await;
        assert!(matches!(third, Err(Error::Duplicate { .. })));
        assert_eq!(h.audit.query(&LogFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_drain() {
        let h = harness().await;
        h.hv.set_delay(Duration::from_millis(100));
        h.executor
            .execute(
                Operation::Restart(Target::resource(105, "pve1")),
                "a",
                TriggerType::Manual,
            )
            .await
            .unwrap();

        let executor = h.executor.clone();
        let draining = tokio::spawn(async move { executor.drain().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            h.executor.execute(
                Operation::Restart(Target::resource(106, "pve2")),
                "b",
                TriggerType::Manual,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        draining.await.unwrap();
        assert_eq!(h.audit.get(second.id).unwrap().status, LogStatus::Success);
        assert!(h.executor.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_without_commands_rejected() {
        let h = harness().await;
        let res = h
            .executor
            .execute(deploy(&[" "]), "alice", TriggerType::Manual)
            .await;
        assert!(matches!(res, Err(Error::Validation(_))));
    }
}
