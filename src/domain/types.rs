//! Data model: inventory mirrored from the hypervisor, whitelist entries,
//! and the restart audit trail.

use std::fmt;
use std::str::FromStr;

use async_graphql::{ComplexObject, Enum, SimpleObject};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default restart interval when a whitelist entry has no override.
pub const DEFAULT_INTERVAL_HOURS: u32 = 6;

// ── Inventory ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Vm,
    Container,
}

impl ResourceKind {
    /// Path segment used by the Proxmox API (`qemu` / `lxc`).
    pub fn api_segment(&self) -> &'static str {
        match self {
            ResourceKind::Vm => "qemu",
            ResourceKind::Container => "lxc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Running,
    Stopped,
    Unknown,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Point-in-time utilization reported by the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct Usage {
    /// Fraction of allotted CPU in use (0.0 - 1.0 per core set).
    pub cpu_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct Resource {
    pub vmid: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub node: String,
    pub status: ResourceStatus,
    #[serde(flatten)]
    pub usage: Usage,
    pub last_synced_at: DateTime<Utc>,
}

impl Resource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.vmid, &self.node)
    }
}

/// Service type recorded when a deploy does not name one.
pub const CUSTOM_SERVICE_TYPE: &str = "custom";

/// A service a successful deploy installed into a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct InstalledService {
    pub id: i64,
    pub vmid: u32,
    pub node: String,
    pub service_name: String,
    /// Free-form label such as `grow`, `connect` or `custom`.
    pub service_type: String,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct Node {
    #[serde(rename = "node_name")]
    pub name: String,
    pub status: NodeStatus,
    #[serde(flatten)]
    pub usage: Usage,
    pub last_synced_at: DateTime<Utc>,
}

/// A VM or container addressed by `(vmid, node)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub vmid: u32,
    pub node: String,
}

impl ResourceRef {
    pub fn new(vmid: u32, node: &str) -> Self {
        Self {
            vmid,
            node: node.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vmid, self.node)
    }
}

/// What a lifecycle operation or whitelist entry points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target_type", rename_all = "lowercase")]
pub enum Target {
    Resource { vmid: u32, node: String },
    Node { name: String },
}

/// Whitelist entries bind to the same two shapes lifecycle operations use.
pub type WhitelistTarget = Target;

impl Target {
    pub fn resource(vmid: u32, node: &str) -> Self {
        Target::Resource {
            vmid,
            node: node.to_string(),
        }
    }

    pub fn node(name: &str) -> Self {
        Target::Node {
            name: name.to_string(),
        }
    }

    /// Stable key: `resource:<vmid>@<node>` or `node:<name>`.
    ///
    /// Used as the whitelist uniqueness key and the in-flight marker.
    pub fn key(&self) -> String {
        match self {
            Target::Resource { vmid, node } => format!("resource:{}@{}", vmid, node),
            Target::Node { name } => format!("node:{}", name),
        }
    }

    pub fn vmid(&self) -> Option<u32> {
        match self {
            Target::Resource { vmid, .. } => Some(*vmid),
            Target::Node { .. } => None,
        }
    }

    /// Node the target lives on (or is).
    pub fn node_name(&self) -> &str {
        match self {
            Target::Resource { node, .. } => node,
            Target::Node { name } => name,
        }
    }
}

impl From<ResourceRef> for Target {
    fn from(r: ResourceRef) -> Self {
        Target::Resource {
            vmid: r.vmid,
            node: r.node,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Resource { vmid, node } => write!(f, "{}@{}", vmid, node),
            Target::Node { name } => write!(f, "node {}", name),
        }
    }
}

// ── Whitelist ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct WhitelistEntry {
    pub id: i64,
    #[serde(flatten)]
    #[graphql(skip)]
    pub target: WhitelistTarget,
    /// Display name captured from the registry at add time.
    pub resource_name: Option<String>,
    pub enabled: bool,
    pub notes: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub interval_hours: Option<u32>,
}

impl WhitelistEntry {
    /// Restart interval, falling back to `default_hours` when unset.
    pub fn interval(&self, default_hours: u32) -> Duration {
        Duration::hours(i64::from(self.interval_hours.unwrap_or(default_hours)))
    }
}

#[ComplexObject]
impl WhitelistEntry {
    async fn target_key(&self) -> String {
        self.target.key()
    }

    async fn vmid(&self) -> Option<u32> {
        self.target.vmid()
    }

    async fn node(&self) -> String {
        self.target.node_name().to_string()
    }
}

// ── Audit log ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Clone,
    Delete,
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Success,
    Failed,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(Error::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

str_enum!(ResourceKind { Vm => "vm", Container => "container" });
str_enum!(ResourceStatus { Running => "running", Stopped => "stopped", Unknown => "unknown" });
str_enum!(NodeStatus { Online => "online", Offline => "offline" });
str_enum!(Action {
    Start => "start",
    Stop => "stop",
    Restart => "restart",
    Clone => "clone",
    Delete => "delete",
    Deploy => "deploy",
});
str_enum!(TriggerType { Auto => "auto", Manual => "manual" });
str_enum!(LogStatus { Pending => "pending", Success => "success", Failed => "failed" });

/// One lifecycle operation, manual or scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct RestartLogEntry {
    pub id: i64,
    pub target_key: String,
    pub vmid: Option<u32>,
    pub resource_name: Option<String>,
    pub node: String,
    pub action: Action,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

/// Fields supplied when a log entry is opened.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub target: Target,
    pub resource_name: Option<String>,
    pub action: Action,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
}

/// How an operation resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { output: Option<String> },
    Failed {
        error: String,
        output: Option<String>,
    },
}

/// Audit log query; every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub vmid: Option<u32>,
    pub resource_name: Option<String>,
    pub node: Option<String>,
    pub action: Option<Action>,
    pub trigger_type: Option<TriggerType>,
    pub status: Option<LogStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub const DEFAULT_LOG_LIMIT: u32 = 100;
pub const MAX_LOG_LIMIT: u32 = 1000;

impl LogFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT)
    }
}

// ── Status ─────────────────────────────────────────────────

/// Dashboard counters. Derived on every request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct SystemStatus {
    pub total_resources: u64,
    pub running_resources: u64,
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub whitelisted_count: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub next_restart_time: Option<DateTime<Utc>>,
    pub total_restarts: u64,
    pub failed_restarts: u64,
    pub in_flight: u64,
}
