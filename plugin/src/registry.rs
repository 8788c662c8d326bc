// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Plugin registry: lifecycle plus O(1) capability dispatch.
//!
//! The registry is populated and initialized before the first inbound RPC is
//! served, then shared immutably behind an `Arc`, so lookups take no locks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{error, info};

use crate::interface::{
    AuditPlugin, AuthPlugin, Plugin, PluginConfig, PluginError, PolicyPlugin, SecretsPlugin,
};
use crate::types::AuditEntry;

/// A registered plugin: the base trait object plus the typed capability views
/// indexed at registration time.
///
/// Concrete plugins construct their own handle, attaching a view for every
/// capability they implement:
///
/// ```ignore
/// let rbac = Arc::new(RbacPlugin::new());
/// registry.register(
///     PluginHandle::new(rbac.clone())
///         .with_auth(rbac.clone())
///         .with_policy(rbac),
/// )?;
/// ```
pub struct PluginHandle {
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) auth: Option<Arc<dyn AuthPlugin>>,
    pub(crate) policy: Option<Arc<dyn PolicyPlugin>>,
    pub(crate) audit: Option<Arc<dyn AuditPlugin>>,
    pub(crate) secrets: Option<Arc<dyn SecretsPlugin>>,
}

impl PluginHandle {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            auth: None,
            policy: None,
            audit: None,
            secrets: None,
        }
    }

    pub fn with_auth(mut self, view: Arc<dyn AuthPlugin>) -> Self {
        self.auth = Some(view);
        self
    }

    pub fn with_policy(mut self, view: Arc<dyn PolicyPlugin>) -> Self {
        self.policy = Some(view);
        self
    }

    pub fn with_audit(mut self, view: Arc<dyn AuditPlugin>) -> Self {
        self.audit = Some(view);
        self
    }

    pub fn with_secrets(mut self, view: Arc<dyn SecretsPlugin>) -> Self {
        self.secrets = Some(view);
        self
    }
}

/// Manages plugin lifecycle and capability lookup.
#[derive(Default)]
pub struct Registry {
    names: HashSet<String>,
    plugins: Vec<Arc<dyn Plugin>>,
    auth: Vec<Arc<dyn AuthPlugin>>,
    policy: Vec<Arc<dyn PolicyPlugin>>,
    audit: Vec<Arc<dyn AuditPlugin>>,
    secrets: Vec<Arc<dyn SecretsPlugin>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. Duplicate names are rejected.
    pub fn register(&mut self, handle: PluginHandle) -> Result<(), PluginError> {
        let name = handle.plugin.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(PluginError::DuplicateName(name));
        }

        if let Some(view) = handle.auth {
            self.auth.push(view);
        }
        if let Some(view) = handle.policy {
            self.policy.push(view);
        }
        if let Some(view) = handle.audit {
            self.audit.push(view);
        }
        if let Some(view) = handle.secrets {
            self.secrets.push(view);
        }
        self.plugins.push(handle.plugin);

        Ok(())
    }

    /// Initialize every registered plugin in registration order. Aborts on
    /// the first failure; plugins initialized before the failure stay
    /// registered.
    pub async fn init_all(
        &self,
        configs: &HashMap<String, PluginConfig>,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            let name = plugin.name().to_string();
            plugin
                .init(configs.get(&name))
                .await
                .map_err(|e| PluginError::Init {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            info!(plugin = %name, version = plugin.version(), "plugin initialized");
        }
        Ok(())
    }

    /// Shut every plugin down in reverse registration order, collecting
    /// errors and returning the last one seen.
    pub async fn shutdown_all(&self) -> Result<(), PluginError> {
        let mut last_err = None;
        for plugin in self.plugins.iter().rev() {
            if let Err(e) = plugin.shutdown().await {
                error!(plugin = plugin.name(), error = %e, "plugin shutdown failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The first-registered auth plugin, if any.
    pub fn auth(&self) -> Option<&Arc<dyn AuthPlugin>> {
        self.auth.first()
    }

    /// The first-registered policy plugin, if any.
    pub fn policy(&self) -> Option<&Arc<dyn PolicyPlugin>> {
        self.policy.first()
    }

    /// The first-registered secrets plugin, if any.
    pub fn secrets(&self) -> Option<&Arc<dyn SecretsPlugin>> {
        self.secrets.first()
    }

    /// Fan an audit entry out to every audit plugin. Never propagates an
    /// error: the providers log internally and the call always succeeds.
    pub async fn audit_all(&self, entry: &AuditEntry) {
        for audit in &self.audit {
            audit.log(entry).await;
        }
    }

    /// All registered plugins, in registration order.
    pub fn list_all(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::interface::Capability;

    struct CountingPlugin {
        name: String,
        inits: AtomicUsize,
        fail_init: bool,
    }

    impl CountingPlugin {
        fn new(name: &str, fail_init: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inits: AtomicUsize::new(0),
                fail_init,
            })
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> &str {
            "0.0.0"
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Monitor]
        }

        async fn init(&self, _config: Option<&PluginConfig>) -> Result<(), PluginError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(PluginError::Other("boom".into()));
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry
            .register(PluginHandle::new(CountingPlugin::new("dup", false)))
            .unwrap();
        let err = registry
            .register(PluginHandle::new(CountingPlugin::new("dup", false)))
            .unwrap_err();
        assert!(matches!(err, PluginError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn init_aborts_on_first_failure() {
        let first = CountingPlugin::new("first", false);
        let second = CountingPlugin::new("second", true);
        let third = CountingPlugin::new("third", false);

        let mut registry = Registry::new();
        registry.register(PluginHandle::new(first.clone())).unwrap();
        registry.register(PluginHandle::new(second)).unwrap();
        registry.register(PluginHandle::new(third.clone())).unwrap();

        let err = registry.init_all(&HashMap::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Init { .. }));
        assert_eq!(first.inits.load(Ordering::SeqCst), 1);
        assert_eq!(third.inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capability_accessors_return_first_registered() {
        let registry = Registry::new();
        assert!(registry.auth().is_none());
        assert!(registry.policy().is_none());
        assert!(registry.secrets().is_none());
    }
}
