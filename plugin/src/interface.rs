// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! The plugin trait set.
//!
//! Every provider implements [`Plugin`]; the orthogonal capability traits
//! ([`AuthPlugin`], [`PolicyPlugin`], [`AuditPlugin`], [`SecretsPlugin`]) are
//! implemented by whichever providers carry that capability. The registry
//! stores the base trait object and indexes the typed views at registration
//! time so capability dispatch stays O(1).

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AuditEntry, AuditFilter, AuthRequest, Identity, PolicyDecision, PolicyRequest};

/// Capabilities a plugin can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Auth,
    Audit,
    Secrets,
    Policy,
    Storage,
    Monitor,
    Notify,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Auth => "auth",
            Capability::Audit => "audit",
            Capability::Secrets => "secrets",
            Capability::Policy => "policy",
            Capability::Storage => "storage",
            Capability::Monitor => "monitoring",
            Capability::Notify => "notifications",
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} already registered")]
    DuplicateName(String),

    #[error("plugin {name} init failed: {message}")]
    Init { name: String, message: String },

    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Per-plugin configuration: the value under `plugins.configs.<name>` in the
/// process config file.
pub type PluginConfig = serde_yaml::Value;

/// Base interface every Mandau plugin implements.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin identifier.
    fn name(&self) -> &str;

    /// Semantic version.
    fn version(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> Vec<Capability>;

    /// Called once during registry initialization, before the first inbound
    /// RPC is served.
    async fn init(&self, config: Option<&PluginConfig>) -> Result<(), PluginError>;

    /// Graceful stop.
    async fn shutdown(&self) -> Result<(), PluginError>;
}

/// Authentication: maps a certificate-derived identity to a known principal.
#[async_trait]
pub trait AuthPlugin: Plugin {
    async fn authenticate(&self, req: &AuthRequest) -> Result<Identity, PluginError>;
}

/// Policy: decides whether an identity may perform an action on a resource.
#[async_trait]
pub trait PolicyPlugin: Plugin {
    async fn evaluate(&self, req: &PolicyRequest) -> Result<PolicyDecision, PluginError>;
}

/// Audit: records security-relevant events. `log` must never fail the call.
#[async_trait]
pub trait AuditPlugin: Plugin {
    async fn log(&self, entry: &AuditEntry);

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, PluginError>;
}

/// Secrets: storage plus environment injection for `${secret:<key>}` tokens.
#[async_trait]
pub trait SecretsPlugin: Plugin {
    async fn get(&self, key: &str) -> Result<Vec<u8>, PluginError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), PluginError>;

    async fn delete(&self, key: &str) -> Result<(), PluginError>;

    /// Replace every value of the exact form `${secret:<key>}` with the
    /// looked-up secret, in place. An unresolved token fails the enclosing
    /// operation.
    async fn inject_env(&self, env: &mut HashMap<String, String>) -> Result<(), PluginError>;
}
