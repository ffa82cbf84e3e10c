//! Hypervisor control plane: the `Hypervisor` trait the domain depends on,
//! and `ProxmoxClient`, its Proxmox VE implementation.
//!
//! Mutating Proxmox calls return a UPID task id; the client polls the task
//! until it stops so callers observe the real outcome, not just acceptance.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::HypervisorConfig;
use crate::error::{Error, RemoteErrorKind, Result};

use super::types::*;

/// A concrete VM/container as the hypervisor addresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub vmid: u32,
    pub node: String,
    pub kind: ResourceKind,
}

impl From<&Resource> for Instance {
    fn from(r: &Resource) -> Self {
        Self {
            vmid: r.vmid,
            node: r.node.clone(),
            kind: r.kind,
        }
    }
}

/// Something that can be powered on, off, or rebooted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerTarget {
    Instance(Instance),
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub source: Instance,
    pub new_vmid: u32,
    pub target_node: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn append_to(&self, transcript: &mut String) {
        transcript.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
            transcript.push('\n');
        }
        transcript.push_str(&self.stderr);
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            transcript.push('\n');
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    async fn get_resources(&self) -> Result<Vec<Resource>>;

    async fn start(&self, target: &PowerTarget) -> Result<Option<String>>;

    async fn stop(&self, target: &PowerTarget) -> Result<Option<String>>;

    async fn restart(&self, target: &PowerTarget) -> Result<Option<String>>;

    async fn clone_resource(&self, req: &CloneRequest) -> Result<Option<String>>;

    async fn delete(&self, instance: &Instance) -> Result<Option<String>>;

    async fn run_command(&self, instance: &Instance, command: &str) -> Result<CommandOutput>;

    /// Block until a freshly started instance accepts commands.
    async fn wait_ready(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }

    /// Run commands in order; the first failure stops the sequence.
    ///
    /// `transcript` receives a `$ <command>` header before each command runs
    /// and its output once it returns, so it stays readable if the caller
    /// abandons the sequence midway.
    async fn run_commands(
        &self,
        instance: &Instance,
        commands: &[String],
        transcript: &Mutex<String>,
    ) -> Result<()> {
        for command in commands {
            transcript.lock().push_str(&format!("$ {}\n", command));
            match self.run_command(instance, command).await {
                Ok(out) => {
                    out.append_to(&mut transcript.lock());
                    if !out.success() {
                        return Err(Error::remote(
                            RemoteErrorKind::Command,
                            format!("`{}` exited with status {}", command, out.exit_code),
                        ));
                    }
                }
                Err(e) => {
                    transcript.lock().push_str(&format!("error: {}\n", e));
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

// ── Proxmox wire types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct PveNode {
    node: String,
    status: String,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    disk: Option<u64>,
    #[serde(default)]
    maxdisk: Option<u64>,
    #[serde(default)]
    uptime: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PveResource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    vmid: Option<u32>,
    node: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    disk: Option<u64>,
    #[serde(default)]
    maxdisk: Option<u64>,
    #[serde(default)]
    uptime: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PveTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestExecResult {
    #[serde(default)]
    exitcode: i32,
    #[serde(rename = "out-data", default)]
    out_data: String,
    #[serde(rename = "err-data", default)]
    err_data: String,
}

fn node_from_wire(n: PveNode) -> Node {
    Node {
        status: if n.status == "online" {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        },
        usage: Usage {
            cpu_usage: n.cpu.unwrap_or_default(),
            memory_used: n.mem.unwrap_or_default(),
            memory_total: n.maxmem.unwrap_or_default(),
            disk_used: n.disk.unwrap_or_default(),
            disk_total: n.maxdisk.unwrap_or_default(),
            uptime: n.uptime.unwrap_or_default(),
        },
        name: n.node,
        last_synced_at: Utc::now(),
    }
}

fn resource_from_wire(r: PveResource) -> Option<Resource> {
    let kind = match r.kind.as_str() {
        "qemu" => ResourceKind::Vm,
        "lxc" => ResourceKind::Container,
        _ => return None,
    };
    let vmid = r.vmid?;
    let status = match r.status.as_deref() {
        Some("running") => ResourceStatus::Running,
        Some("stopped") => ResourceStatus::Stopped,
        _ => ResourceStatus::Unknown,
    };
    Some(Resource {
        name: r.name.unwrap_or_else(|| format!("{}-{}", kind, vmid)),
        vmid,
        kind,
        node: r.node,
        status,
        usage: Usage {
            cpu_usage: r.cpu.unwrap_or_default(),
            memory_used: r.mem.unwrap_or_default(),
            memory_total: r.maxmem.unwrap_or_default(),
            disk_used: r.disk.unwrap_or_default(),
            disk_total: r.maxdisk.unwrap_or_default(),
            uptime: r.uptime.unwrap_or_default(),
        },
        last_synced_at: Utc::now(),
    })
}

/// Quote for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

// ── Proxmox client ─────────────────────────────────────────

pub struct ProxmoxClient {
    base_url: String,
    http: Client,
    auth_header: String,
    task_timeout: Duration,
    command_timeout: Duration,
    poll_interval: Duration,
    ssh_user: String,
}

impl ProxmoxClient {
    pub fn new(config: &HypervisorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Internal(format!("building HTTP client: {}", e)))?;
        Ok(Self {
            base_url: format!("{}/api2/json", config.base_url.trim_end_matches('/')),
            http,
            auth_header: format!("PVEAPIToken={}={}", config.token_id, config.token_secret),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            poll_interval: Duration::from_millis(config.task_poll_millis),
            ssh_user: config.ssh_user.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", &self.auth_header);
        if !form.is_empty() {
            req = if method == Method::GET || method == Method::DELETE {
                req.query(form)
            } else {
                req.form(form)
            };
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::remote(
                RemoteErrorKind::Api,
                format!("{} {} returned {}: {}", method, path, status, body.trim()),
            ));
        }
        let envelope: Envelope<T> = resp.json().await?;
        Ok(envelope.data)
    }

    /// Issue a task-producing call and wait for the task to finish.
    async fn run_task(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
        node: &str,
    ) -> Result<Option<String>> {
        let upid: Option<String> = self.call(method, path, form).await?;
        match upid {
            Some(upid) => {
                self.wait_task(node, &upid).await?;
                Ok(Some(upid))
            }
            None => Ok(None),
        }
    }

    async fn wait_task(&self, node: &str, upid: &str) -> Result<()> {
        tokio::time::timeout(self.task_timeout, self.poll_task(node, upid))
            .await
            .map_err(|_| Error::timeout(&format!("task {}", upid), self.task_timeout.as_secs()))?
    }

    async fn poll_task(&self, node: &str, upid: &str) -> Result<()> {
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            node,
            urlencoding::encode(upid)
        );
        loop {
            let task: PveTaskStatus = self.call(Method::GET, &path, &[]).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(Error::remote(
                        RemoteErrorKind::Api,
                        format!("task {} failed: {}", upid, other.unwrap_or("no exit status")),
                    )),
                };
            }
            debug!(upid = %upid, "task still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn power(&self, target: &PowerTarget, verb: &str) -> Result<Option<String>> {
        match target {
            PowerTarget::Instance(i) => {
                let path = format!(
                    "/nodes/{}/{}/{}/status/{}",
                    i.node,
                    i.kind.api_segment(),
                    i.vmid,
                    verb
                );
                self.run_task(Method::POST, &path, &[], &i.node).await
            }
            PowerTarget::Node(name) => {
                let (path, form) = match verb {
                    "start" => (format!("/nodes/{}/wakeonlan", name), Vec::new()),
                    "stop" => (
                        format!("/nodes/{}/status", name),
                        vec![("command", "shutdown".to_string())],
                    ),
                    _ => (
                        format!("/nodes/{}/status", name),
                        vec![("command", "reboot".to_string())],
                    ),
                };
                let _: serde_json::Value = self.call(Method::POST, &path, &form).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Vec<PveNode> = self.call(Method::GET, "/nodes", &[]).await?;
        Ok(nodes.into_iter().map(node_from_wire).collect())
    }

    async fn get_resources(&self) -> Result<Vec<Resource>> {
        let resources: Vec<PveResource> = self
            .call(
                Method::GET,
                "/cluster/resources",
                &[("type", "vm".to_string())],
            )
            .await?;
        Ok(resources.into_iter().filter_map(resource_from_wire).collect())
    }

    async fn start(&self, target: &PowerTarget) -> Result<Option<String>> {
        self.power(target, "start").await
    }

    async fn stop(&self, target: &PowerTarget) -> Result<Option<String>> {
        self.power(target, "stop").await
    }

    async fn restart(&self, target: &PowerTarget) -> Result<Option<String>> {
        self.power(target, "reboot").await
    }

    async fn clone_resource(&self, req: &CloneRequest) -> Result<Option<String>> {
        let src = &req.source;
        let path = format!("/nodes/{}/{}/{}/clone", src.node, src.kind.api_segment(), src.vmid);
        let mut form = vec![
            ("newid", req.new_vmid.to_string()),
            ("full", "1".to_string()),
        ];
        if req.target_node != src.node {
            form.push(("target", req.target_node.clone()));
        }
        if let Some(hostname) = req.hostname.as_ref().filter(|h| !h.is_empty()) {
            let key = match src.kind {
                ResourceKind::Container => "hostname",
                ResourceKind::Vm => "name",
            };
            form.push((key, hostname.clone()));
        }
        self.run_task(Method::POST, &path, &form, &src.node).await
    }

    async fn delete(&self, instance: &Instance) -> Result<Option<String>> {
        let path = format!(
            "/nodes/{}/{}/{}",
            instance.node,
            instance.kind.api_segment(),
            instance.vmid
        );
        self.run_task(Method::DELETE, &path, &[("purge", "1".to_string())], &instance.node)
            .await
    }

    /// Containers take `pct exec` as soon as they run; VMs need the guest
    /// agent, which comes up some time after boot.
    async fn wait_ready(&self, instance: &Instance) -> Result<()> {
        if instance.kind != ResourceKind::Vm {
            return Ok(());
        }
        let path = format!("/nodes/{}/qemu/{}/agent/ping", instance.node, instance.vmid);
        let poll = async {
            loop {
                match self.call::<serde_json::Value>(Method::POST, &path, &[]).await {
                    Ok(_) => return,
                    Err(e) => debug!(vmid = instance.vmid, error = %e, "guest agent not ready"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.task_timeout, poll).await.map_err(|_| {
            Error::timeout(
                &format!("guest agent of {}", instance.vmid),
                self.task_timeout.as_secs(),
            )
        })
    }

    async fn run_command(&self, instance: &Instance, command: &str) -> Result<CommandOutput> {
        let remote = match instance.kind {
            ResourceKind::Container => format!(
                "pct exec {} -- sh -c {}",
                instance.vmid,
                shell_quote(command)
            ),
            ResourceKind::Vm => format!(
                "qm guest exec {} -- sh -c {}",
                instance.vmid,
                shell_quote(command)
            ),
        };
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            &format!("{}@{}", self.ssh_user, instance.node),
            &remote,
        ])
        .kill_on_drop(true);

        let out = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| Error::timeout(&format!("`{}`", command), self.command_timeout.as_secs()))?
            .map_err(|e| Error::remote(RemoteErrorKind::Network, format!("spawning ssh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        let exit_code = out.status.code().unwrap_or(-1);

        // `qm guest exec` wraps the guest result in JSON and exits 0 itself.
        if instance.kind == ResourceKind::Vm && exit_code == 0 {
            if let Ok(guest) = serde_json::from_str::<GuestExecResult>(&stdout) {
                return Ok(CommandOutput {
                    exit_code: guest.exitcode,
                    stdout: guest.out_data,
                    stderr: guest.err_data,
                });
            }
        }
        if exit_code == 255 {
            return Err(Error::remote(
                RemoteErrorKind::Network,
                format!("ssh to {} failed: {}", instance.node, stderr.trim()),
            ));
        }
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
