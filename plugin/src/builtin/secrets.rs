// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Local secrets provider.
//!
//! Secrets live in a single JSON document on the host (mode 0600). The stack
//! engine consults this plugin while preparing an apply: any environment
//! value of the exact form `${secret:<key>}` is replaced by the stored value,
//! and a miss fails the operation. Resolved values are handed to the compose
//! process environment only; they are never written under the stack root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::interface::{Capability, Plugin, PluginConfig, PluginError, SecretsPlugin};

const DEFAULT_STORE_PATH: &str = "/var/lib/mandau/secrets.json";
const TOKEN_PREFIX: &str = "${secret:";
const TOKEN_SUFFIX: &str = "}";

struct SecretsState {
    path: PathBuf,
    values: HashMap<String, String>,
}

pub struct LocalSecretsPlugin {
    state: RwLock<SecretsState>,
}

impl LocalSecretsPlugin {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SecretsState {
                path: PathBuf::from(DEFAULT_STORE_PATH),
                values: HashMap::new(),
            }),
        }
    }

    /// The `<key>` of a `${secret:<key>}` value, if the whole value is one
    /// token.
    fn secret_key(value: &str) -> Option<&str> {
        value
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|rest| rest.strip_suffix(TOKEN_SUFFIX))
    }

    fn persist(state: &SecretsState) -> Result<(), PluginError> {
        if let Some(parent) = state.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::Other(format!("create secrets dir: {e}")))?;
        }
        let data = serde_json::to_vec_pretty(&state.values)
            .map_err(|e| PluginError::Other(format!("encode secrets: {e}")))?;
        std::fs::write(&state.path, data)
            .map_err(|e| PluginError::Other(format!("write secrets store: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&state.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

impl Default for LocalSecretsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for LocalSecretsPlugin {
    fn name(&self) -> &str {
        "local-secrets"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Secrets]
    }

    async fn init(&self, config: Option<&PluginConfig>) -> Result<(), PluginError> {
        let path = config
            .and_then(|c| c.get("path"))
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_STORE_PATH)
            .to_string();

        let mut state = self.state.write().expect("secrets state poisoned");
        state.path = PathBuf::from(&path);
        state.values = match std::fs::read(&state.path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| PluginError::Other(format!("parse secrets store {path}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(PluginError::Other(format!("read secrets store {path}: {e}"))),
        };
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl SecretsPlugin for LocalSecretsPlugin {
    async fn get(&self, key: &str) -> Result<Vec<u8>, PluginError> {
        let state = self.state.read().expect("secrets state poisoned");
        state
            .values
            .get(key)
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(|| PluginError::SecretNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), PluginError> {
        let value = std::str::from_utf8(value)
            .map_err(|_| PluginError::Other("secret value is not utf-8".into()))?
            .to_string();
        let mut state = self.state.write().expect("secrets state poisoned");
        state.values.insert(key.to_string(), value);
        Self::persist(&state)
    }

    async fn delete(&self, key: &str) -> Result<(), PluginError> {
        let mut state = self.state.write().expect("secrets state poisoned");
        state.values.remove(key);
        Self::persist(&state)
    }

    async fn inject_env(&self, env: &mut HashMap<String, String>) -> Result<(), PluginError> {
        let state = self.state.read().expect("secrets state poisoned");
        for value in env.values_mut() {
            if let Some(key) = Self::secret_key(value) {
                let resolved = state
                    .values
                    .get(key)
                    .ok_or_else(|| PluginError::SecretNotFound(key.to_string()))?;
                *value = resolved.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn plugin_in(dir: &std::path::Path) -> LocalSecretsPlugin {
        let plugin = LocalSecretsPlugin::new();
        let config: PluginConfig =
            serde_yaml::from_str(&format!("path: {}", dir.join("secrets.json").display()))
                .unwrap();
        plugin.init(Some(&config)).await.unwrap();
        plugin
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path()).await;

        plugin.set("db_password", b"hunter2").await.unwrap();
        assert_eq!(plugin.get("db_password").await.unwrap(), b"hunter2");

        plugin.delete("db_password").await.unwrap();
        let err = plugin.get("db_password").await.unwrap_err();
        assert!(matches!(err, PluginError::SecretNotFound(_)));
    }

    #[tokio::test]
    async fn store_survives_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path()).await;
        plugin.set("token", b"abc123").await.unwrap();

        let reloaded = plugin_in(dir.path()).await;
        assert_eq!(reloaded.get("token").await.unwrap(), b"abc123");
    }

    #[tokio::test]
    async fn inject_env_replaces_exact_tokens_only() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path()).await;
        plugin.set("db_password", b"hunter2").await.unwrap();

        let mut env = HashMap::from([
            ("DB_PASSWORD".to_string(), "${secret:db_password}".to_string()),
            ("DB_HOST".to_string(), "db.internal".to_string()),
            // Embedded tokens are not interpolated; only exact-form values.
            ("NOTE".to_string(), "prefix ${secret:db_password}".to_string()),
        ]);

        plugin.inject_env(&mut env).await.unwrap();
        assert_eq!(env["DB_PASSWORD"], "hunter2");
        assert_eq!(env["DB_HOST"], "db.internal");
        assert_eq!(env["NOTE"], "prefix ${secret:db_password}");
    }

    #[tokio::test]
    async fn unresolved_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path()).await;

        let mut env = HashMap::from([(
            "API_KEY".to_string(),
            "${secret:missing}".to_string(),
        )]);
        let err = plugin.inject_env(&mut env).await.unwrap_err();
        assert!(matches!(err, PluginError::SecretNotFound(_)));
    }
}
