// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Control Node configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mandau/core.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent_management: AgentManagementConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManagementConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_offline_timeout_secs")]
    pub offline_timeout_secs: u64,
}

impl Default for AgentManagementConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            offline_timeout_secs: default_offline_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
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

impl CoreConfig {
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
    "0.0.0.0:8443".to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/mandau/core.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/mandau/core.key")
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("/etc/mandau/ca.crt")
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_offline_timeout_secs() -> u64 {
    90
}
