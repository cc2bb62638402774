//! Agent configuration
//!
//! Read from the YAML file named by `MESH_CONFIG` when set, defaults
//! otherwise. A handful of environment variables override single fields.

use anyhow::{Context, Result};
use mesh_core::ChannelOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MESH_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// etcd endpoints; empty runs against an in-process store
    pub etcd_endpoints: Vec<String>,
    /// Prefix watched for membership changes
    pub base_service: String,
    /// Services whose nodes are pooled
    pub interests: Vec<String>,
    pub registration: Option<RegistrationConfig>,
    pub lease_ttl_secs: u64,
    pub channel: ChannelConfig,
    pub log: LogConfig,
    pub admin_addr: SocketAddr,
}

/// Address this agent publishes for itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub service: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub connect_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// JSON lines to `file` at `level` instead of everything to stdout
    pub release: bool,
    pub file: PathBuf,
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: Vec::new(),
            base_service: "/service".to_string(),
            interests: Vec::new(),
            registration: None,
            lease_ttl_secs: 3,
            channel: ChannelConfig::default(),
            log: LogConfig::default(),
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let options = ChannelOptions::default();
        Self {
            connect_timeout_ms: None,
            call_timeout_ms: None,
            max_retries: options.max_retries,
            retry_backoff_ms: options.retry_backoff.as_millis() as u64,
            protocol: options.protocol,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            release: false,
            file: PathBuf::from("mesh-agent.log"),
            level: "info".to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn to_options(&self) -> ChannelOptions {
        ChannelOptions {
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            protocol: self.protocol.clone(),
        }
    }
}

impl AgentConfig {
    /// Load the configuration for this process
    pub fn load() -> Result<Self> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `MESH_*` overrides looked up through `lookup`
    pub fn apply_overrides<L>(mut self, lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(endpoints) = lookup("MESH_ETCD") {
            self.etcd_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(base) = lookup("MESH_BASE_SERVICE") {
            self.base_service = base;
        }
        if let Some(level) = lookup("MESH_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(addr) = lookup("MESH_ADMIN_ADDR") {
            self.admin_addr = addr
                .parse()
                .with_context(|| format!("Invalid MESH_ADMIN_ADDR {}", addr))?;
        }
        Ok(self)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert!(config.etcd_endpoints.is_empty());
        assert_eq!(config.base_service, "/service");
        assert_eq!(config.lease_ttl(), Duration::from_secs(3));
        assert_eq!(config.channel.to_options(), ChannelOptions::default());
        assert!(!config.log.release);
    }

    #[test]
    fn test_from_yaml() {
        let raw = r#"
etcd_endpoints: ["http://etcd-0:2379", "http://etcd-1:2379"]
interests: [/service/echo]
registration:
  service: /service/user
  address: 10.0.0.7:9000
lease_ttl_secs: 5
channel:
  call_timeout_ms: 250
  max_retries: 1
  retry_backoff_ms: 20
  protocol: http
log:
  release: true
  file: /var/log/mesh.log
  level: warn
admin_addr: 127.0.0.1:9191
"#;
        let config = AgentConfig::from_yaml(raw).unwrap();

        assert_eq!(config.etcd_endpoints.len(), 2);
        assert_eq!(config.base_service, "/service");
        assert_eq!(config.interests, vec!["/service/echo".to_string()]);
        assert_eq!(
            config.registration,
            Some(RegistrationConfig {
                service: "/service/user".to_string(),
                address: "10.0.0.7:9000".to_string(),
            })
        );
        assert_eq!(config.lease_ttl(), Duration::from_secs(5));

        let options = config.channel.to_options();
        assert_eq!(options.connect_timeout, None);
        assert_eq!(options.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.max_retries, 1);
        assert_eq!(options.retry_backoff, Duration::from_millis(20));
        assert_eq!(options.protocol, "http");

        assert!(config.log.release);
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.admin_addr, "127.0.0.1:9191".parse().unwrap());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(AgentConfig::from_yaml("lease_ttl_secs: soon").is_err());
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::default()
            .apply_overrides(env(&[
                ("MESH_ETCD", "http://a:2379, http://b:2379,"),
                ("MESH_BASE_SERVICE", "/prod"),
                ("MESH_LOG_LEVEL", "debug"),
                ("MESH_ADMIN_ADDR", "127.0.0.1:8000"),
            ]))
            .unwrap();

        assert_eq!(config.etcd_endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(config.base_service, "/prod");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.admin_addr, "127.0.0.1:8000".parse().unwrap());
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = AgentConfig::default().apply_overrides(env(&[])).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_bad_admin_addr_override() {
        let result = AgentConfig::default().apply_overrides(env(&[("MESH_ADMIN_ADDR", "nowhere")]));
        assert!(result.is_err());
    }
}
