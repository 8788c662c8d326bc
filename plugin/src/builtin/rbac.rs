// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Role-based access control plugin (capabilities: auth + policy).
//!
//! Principals are certificate common names. A principal is authenticated iff
//! it maps to a configured user; it is authorized iff some role of theirs has
//! a permission whose resource glob matches the request's resource and whose
//! action set contains the request's action (`*` matches anything on either
//! axis; a trailing `*` in a resource glob matches any suffix).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::interface::{
    AuthPlugin, Capability, Plugin, PluginConfig, PluginError, PolicyPlugin,
};
use crate::types::{Action, AuthRequest, Identity, PolicyDecision, PolicyRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    /// Resource glob, e.g. `stack:*`, `container:web-*`, `*`.
    pub resource: String,
    /// Allowed actions, e.g. `["read", "write"]`; `*` allows everything.
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbacConfig {
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl RbacConfig {
    /// The stock role set used when no configuration is supplied: admin
    /// (everything), operator (stacks/containers/images/files), viewer
    /// (read-only), plus the control-plane principals themselves.
    pub fn default_roles() -> Self {
        let roles = vec![
            Role {
                name: "admin".into(),
                permissions: vec![Permission {
                    resource: "*".into(),
                    actions: vec!["*".into()],
                }],
            },
            Role {
                name: "operator".into(),
                permissions: vec![
                    Permission {
                        resource: "stack:*".into(),
                        actions: vec!["read".into(), "write".into(), "delete".into()],
                    },
                    Permission {
                        resource: "container:*".into(),
                        actions: vec!["read".into(), "exec".into(), "logs".into()],
                    },
                    Permission {
                        resource: "image:*".into(),
                        actions: vec!["read".into(), "pull".into()],
                    },
                    Permission {
                        resource: "file:*".into(),
                        actions: vec!["read".into(), "write".into()],
                    },
                ],
            },
            Role {
                name: "viewer".into(),
                permissions: vec![Permission {
                    resource: "*".into(),
                    actions: vec!["read".into(), "logs".into()],
                }],
            },
        ];

        let users = vec![
            User {
                id: "admin@example.com".into(),
                name: "Administrator".into(),
                roles: vec!["admin".into()],
            },
            User {
                id: "mandau-core".into(),
                name: "Control Node".into(),
                roles: vec!["admin".into()],
            },
            User {
                id: "mandau-agent".into(),
                name: "Host Agent".into(),
                roles: vec!["admin".into()],
            },
            User {
                id: "mandau-cli".into(),
                name: "CLI".into(),
                roles: vec!["admin".into()],
            },
        ];

        Self { roles, users }
    }
}

struct RbacState {
    roles: HashMap<String, Role>,
    users: HashMap<String, User>,
}

pub struct RbacPlugin {
    state: RwLock<RbacState>,
}

impl RbacPlugin {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RbacState {
                roles: HashMap::new(),
                users: HashMap::new(),
            }),
        }
    }

    fn load(&self, config: RbacConfig) {
        let mut state = self.state.write().expect("rbac state poisoned");
        state.roles = config
            .roles
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        state.users = config.users.into_iter().map(|u| (u.id.clone(), u)).collect();
    }

    fn matches_resource(pattern: &str, resource: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return resource.starts_with(prefix);
        }
        pattern == resource
    }

    fn matches_action(allowed: &[String], action: &str) -> bool {
        allowed.iter().any(|a| a == "*" || a == action)
    }

    fn role_permits(role: &Role, action: &Action) -> bool {
        role.permissions.iter().any(|perm| {
            Self::matches_resource(&perm.resource, &action.resource)
                && Self::matches_action(&perm.actions, &action.action)
        })
    }

    fn authorize(&self, identity: &Identity, action: &Action) -> Result<(), String> {
        let state = self.state.read().expect("rbac state poisoned");
        let user = state
            .users
            .get(&identity.principal_id)
            .ok_or_else(|| format!("user not found: {}", identity.principal_id))?;

        for role_name in &user.roles {
            if let Some(role) = state.roles.get(role_name) {
                if Self::role_permits(role, action) {
                    return Ok(());
                }
            }
        }

        Err(format!(
            "permission denied: {} may not {} {}",
            identity.principal_id, action.action, action.resource
        ))
    }
}

impl Default for RbacPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for RbacPlugin {
    fn name(&self) -> &str {
        "rbac-auth"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Auth, Capability::Policy]
    }

    async fn init(&self, config: Option<&PluginConfig>) -> Result<(), PluginError> {
        let parsed = match config {
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| PluginError::Other(format!("rbac config: {e}")))?,
            None => RbacConfig::default_roles(),
        };
        self.load(parsed);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl AuthPlugin for RbacPlugin {
    async fn authenticate(&self, req: &AuthRequest) -> Result<Identity, PluginError> {
        let state = self.state.read().expect("rbac state poisoned");
        let user = state
            .users
            .get(&req.identity.principal_id)
            .ok_or_else(|| {
                PluginError::Unauthenticated(format!(
                    "user not found: {}",
                    req.identity.principal_id
                ))
            })?;

        let mut identity = req.identity.clone();
        identity.roles = user.roles.clone();
        Ok(identity)
    }
}

#[async_trait]
impl PolicyPlugin for RbacPlugin {
    async fn evaluate(&self, req: &PolicyRequest) -> Result<PolicyDecision, PluginError> {
        match self.authorize(&req.identity, &req.action) {
            Ok(()) => Ok(PolicyDecision::allow()),
            Err(reason) => Ok(PolicyDecision::deny(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn plugin_with(config: RbacConfig) -> RbacPlugin {
        let plugin = RbacPlugin::new();
        plugin.load(config);
        plugin
    }

    fn operator_only() -> RbacConfig {
        RbacConfig {
            roles: vec![Role {
                name: "container-reader".into(),
                permissions: vec![Permission {
                    resource: "container:*".into(),
                    actions: vec!["read".into()],
                }],
            }],
            users: vec![User {
                id: "ops@example.com".into(),
                name: "Ops".into(),
                roles: vec!["container-reader".into()],
            }],
        }
    }

    #[tokio::test]
    async fn unknown_user_fails_authentication() {
        let plugin = plugin_with(operator_only()).await;
        let err = plugin
            .authenticate(&AuthRequest {
                identity: Identity::new("stranger@example.com"),
                method: "/mandau.v1.CoreService/ListAgents".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn authentication_attaches_roles() {
        let plugin = plugin_with(operator_only()).await;
        let identity = plugin
            .authenticate(&AuthRequest {
                identity: Identity::new("ops@example.com"),
                method: "/mandau.v1.ContainerService/ListContainers".into(),
            })
            .await
            .unwrap();
        assert_eq!(identity.roles, vec!["container-reader".to_string()]);
    }

    #[tokio::test]
    async fn container_reader_cannot_apply_stacks() {
        let plugin = plugin_with(operator_only()).await;
        let decision = plugin
            .evaluate(&PolicyRequest {
                identity: Identity::new("ops@example.com"),
                action: Action::new("/mandau.v1.StackService/ApplyStack", "write", "stack:web"),
                resource: crate::types::Resource::new("stack", "web"),
            })
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(!decision.reason.is_empty());
    }

    #[tokio::test]
    async fn container_reader_can_read_containers() {
        let plugin = plugin_with(operator_only()).await;
        let decision = plugin
            .evaluate(&PolicyRequest {
                identity: Identity::new("ops@example.com"),
                action: Action::new(
                    "/mandau.v1.ContainerService/ListContainers",
                    "read",
                    "container:web-1",
                ),
                resource: crate::types::Resource::new("container", "web-1"),
            })
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn star_matches_everything() {
        let plugin = plugin_with(RbacConfig::default_roles()).await;
        let decision = plugin
            .evaluate(&PolicyRequest {
                identity: Identity::new("admin@example.com"),
                action: Action::new("/x", "delete", "stack:anything"),
                resource: crate::types::Resource::new("stack", "anything"),
            })
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn evaluation_is_pure_over_inputs() {
        let plugin = plugin_with(operator_only()).await;
        let req = PolicyRequest {
            identity: Identity::new("ops@example.com"),
            action: Action::new("/x", "read", "container:a"),
            resource: crate::types::Resource::new("container", "a"),
        };
        let first = plugin.evaluate(&req).await.unwrap();
        let second = plugin.evaluate(&req).await.unwrap();
        assert_eq!(first.allowed, second.allowed);
        assert_eq!(first.reason, second.reason);
    }

    #[tokio::test]
    async fn yaml_config_is_loaded() {
        let yaml = r#"
roles:
  - name: admin
    permissions:
      - resource: "*"
        actions: ["*"]
users:
  - id: "root@example.com"
    name: "Root"
    roles: ["admin"]
"#;
        let value: PluginConfig = serde_yaml::from_str(yaml).unwrap();
        let plugin = RbacPlugin::new();
        plugin.init(Some(&value)).await.unwrap();

        let identity = plugin
            .authenticate(&AuthRequest {
                identity: Identity::new("root@example.com"),
                method: "/x".into(),
            })
            .await
            .unwrap();
        assert_eq!(identity.roles, vec!["admin".to_string()]);
    }
}
