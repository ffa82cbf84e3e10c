use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::domain::types::DEFAULT_INTERVAL_HOURS;

/// Top-level configuration: defaults → YAML file → `WARDEN_*` environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: String,
    pub database_path: PathBuf,
    pub auth: AuthConfig,
    pub hypervisor: HypervisorConfig,
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            database_path: default_database_path(),
            auth: AuthConfig::default(),
            hypervisor: HypervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
            executor: ExecutorConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Basic credentials every API request must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// e.g. `https://pve1.lan:8006`
    pub base_url: String,
    /// `user@realm!tokenname`
    pub token_id: String,
    pub token_secret: String,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub task_poll_millis: u64,
    pub command_timeout_secs: u64,
    pub ssh_user: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            verify_tls: true,
            request_timeout_secs: 30,
            task_timeout_secs: 300,
            task_poll_millis: 1000,
            command_timeout_secs: 600,
            ssh_user: "root".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub default_interval_hours: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
            default_interval_hours: DEFAULT_INTERVAL_HOURS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 0 disables periodic sync.
    pub sync_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound for one lifecycle operation, end to end.
    pub operation_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 900,
        }
    }
}

/// Where `warden query` finds the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            username: "admin".to_string(),
            password: String::new(),
        }
    }
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("warden").join("config.yaml"))
    }

    /// Checks the daemon needs before it starts serving.
    pub fn validate_daemon(&self) -> Result<()> {
        if self.auth.password.is_empty() {
            bail!("auth.password is not set (WARDEN_AUTH__PASSWORD)");
        }
        if self.hypervisor.base_url.is_empty() {
            bail!("hypervisor.base_url is not set (WARDEN_HYPERVISOR__BASE_URL)");
        }
        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be greater than zero");
        }
        if self.scheduler.default_interval_hours == 0 {
            bail!("scheduler.default_interval_hours must be greater than zero");
        }
        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
        .join("warden.db")
}

/// Load config from `path` (or the default location) layered over defaults,
/// then apply `WARDEN_` environment overrides (`__` separates sections).
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::path()?,
    };
    figment_for(&path)
        .merge(Env::prefixed("WARDEN_").split("__"))
        .extract()
        .with_context(|| format!("loading configuration ({})", path.display()))
}

fn figment_for(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(Config::default())).merge(Yaml::file(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Config = figment_for(&dir.path().join("missing.yaml"))
            .extract()
            .unwrap();
        assert_eq!(cfg.http_addr, "127.0.0.1:8080");
        assert_eq!(cfg.scheduler.tick_secs, 60);
        assert_eq!(cfg.scheduler.default_interval_hours, 6);
        assert!(cfg.validate_daemon().is_err());
    }

    #[test]
    fn test_yaml_overrides_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "http_addr: 0.0.0.0:9000\n\
             auth:\n  password: s3cret\n\
             hypervisor:\n  base_url: https://pve1:8006\n  verify_tls: false\n\
             scheduler:\n  tick_secs: 5\n",
        )
        .unwrap();

        let cfg: Config = figment_for(&path).extract().unwrap();
        assert_eq!(cfg.http_addr, "0.0.0.0:9000");
        assert_eq!(cfg.auth.username, "admin");
        assert_eq!(cfg.auth.password, "s3cret");
        assert!(!cfg.hypervisor.verify_tls);
        assert_eq!(cfg.hypervisor.task_timeout_secs, 300);
        assert_eq!(cfg.scheduler.tick_secs, 5);
        assert!(cfg.validate_daemon().is_ok());
    }

    #[test]
    fn test_zero_tick_rejected() {
        let mut cfg = Config::default();
        cfg.auth.password = "x".into();
        cfg.hypervisor.base_url = "https://pve".into();
        cfg.scheduler.tick_secs = 0;
        assert!(cfg.validate_daemon().is_err());
    }
}
