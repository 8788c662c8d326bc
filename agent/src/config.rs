// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Agent configuration.
//!
//! Loaded from YAML (`--config`, `MANDAU_CONFIG_PATH`, or the default
//! location), with built-in defaults when no file exists. Command-line flags
//! override file values in `main`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mandau/agent.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentInfoConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub server_connection: ServerConnectionConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub stacks: StacksConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfoConfig {
    /// Stable agent id; empty means load from `stack_root/.agent_id` or
    /// derive from the hostname on first boot.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnectionConfig {
    #[serde(default = "default_core_addr")]
    pub core_addr: String,
}

impl Default for ServerConnectionConfig {
    fn default() -> Self {
        Self {
            core_addr: default_core_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: default_ca_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Empty means environment defaults.
    #[serde(default)]
    pub socket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacksConfig {
    #[serde(default = "default_stack_root")]
    pub root_dir: PathBuf,
}

impl Default for StacksConfig {
    fn default() -> Self {
        Self {
            root_dir: default_stack_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Wall-clock limit for container exec, in seconds.
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            exec_timeout_secs: default_exec_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Plugin name -> enabled flag. The set is fixed before the first
    /// inbound RPC is served.
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
    /// Plugin name -> init configuration.
    #[serde(default)]
    pub configs: HashMap<String, serde_yaml::Value>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: HashMap::from([("rbac-auth".to_string(), true)]),
            configs: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load from an explicit path, the environment override, or the default
    /// location; fall back to built-in defaults when nothing is found.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            let config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded configuration");
            return Ok(config);
        }

        if let Ok(path) = std::env::var("MANDAU_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                let config = Self::from_yaml_file(&path)?;
                tracing::info!(path = %path.display(), "loaded configuration");
                return Ok(config);
            }
        }

        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            let config = Self::from_yaml_file(default)?;
            tracing::info!(path = %default.display(), "loaded configuration");
            return Ok(config);
        }

        tracing::warn!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8444".to_string()
}

fn default_core_addr() -> String {
    "localhost:8443".to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/mandau/agent.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/mandau/agent.key")
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("/etc/mandau/ca.crt")
}

fn default_stack_root() -> PathBuf {
    PathBuf::from("/var/lib/mandau/stacks")
}

fn default_exec_timeout_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AgentConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8444");
        assert_eq!(config.server_connection.core_addr, "localhost:8443");
        assert_eq!(config.security.exec_timeout_secs, 3600);
        assert_eq!(config.plugins.enabled.get("rbac-auth"), Some(&true));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = r#"
stacks:
  root_dir: /srv/stacks
plugins:
  enabled:
    rbac-auth: true
    file-audit: true
  configs:
    file-audit:
      log_dir: /srv/log/mandau
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stacks.root_dir, PathBuf::from("/srv/stacks"));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8444");
        assert_eq!(config.plugins.enabled.len(), 2);
        assert!(config.plugins.configs.contains_key("file-audit"));
    }
}
