// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Data types shared across the plugin surface.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated principal derived from a verified peer certificate.
///
/// Request-scoped: attached after authentication and consumed by the policy
/// and audit stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Certificate subject common name.
    pub principal_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    /// Raw DER bytes of the leaf certificate.
    #[serde(skip)]
    pub certificate: Vec<u8>,
}

impl Identity {
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            ..Default::default()
        }
    }
}

/// An operation being performed, as seen by policy evaluation.
#[derive(Debug, Clone, Default)]
pub struct Action {
    /// Full RPC method, e.g. `/mandau.v1.StackService/ApplyStack`.
    pub method: String,
    /// Verb: read, write, delete, exec, logs, pull.
    pub action: String,
    /// Resource string, e.g. `stack:web`.
    pub resource: String,
}

impl Action {
    pub fn new(
        method: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            action: action.into(),
            resource: resource.into(),
        }
    }
}

/// The target of an action, derived from the request by each handler.
#[derive(Debug, Clone, Default)]
pub struct Resource {
    /// stack, container, image, file, agent, operation.
    pub kind: String,
    pub identifier: String,
    pub labels: HashMap<String, String>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identifier: identifier.into(),
            labels: HashMap::new(),
        }
    }

    /// The `kind:identifier` form RBAC permissions match against.
    pub fn qualified(&self) -> String {
        if self.identifier.is_empty() {
            self.kind.clone()
        } else {
            format!("{}:{}", self.kind, self.identifier)
        }
    }
}

/// Input to the authentication stage.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub identity: Identity,
    pub method: String,
}

/// Input to the policy stage.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub identity: Identity,
    pub action: Action,
    pub resource: Resource,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// A single audit record. Serialized as one JSON object per line by the file
/// audit plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// "success" or "error".
    pub result: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Filter for querying audit records back out of storage.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub principal_id: Option<String>,
    pub action: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_resource_joins_kind_and_id() {
        assert_eq!(Resource::new("stack", "web").qualified(), "stack:web");
        assert_eq!(Resource::new("agent", "").qualified(), "agent");
    }

    #[test]
    fn audit_entry_roundtrips_through_json() {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            agent_id: "agent-node-a".into(),
            identity: Some(Identity::new("ops@example.com")),
            action: "/mandau.v1.StackService/ApplyStack".into(),
            resource: "stack:web".into(),
            result: "success".into(),
            duration: Duration::from_millis(42),
            metadata: HashMap::new(),
        };

        let line = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.result, "success");
        assert_eq!(back.duration, Duration::from_millis(42));
        assert_eq!(back.identity.unwrap().principal_id, "ops@example.com");
    }
}
