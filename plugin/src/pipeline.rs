// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! The per-RPC interceptor chain.
//!
//! Every inbound RPC on both the Control Node and the Host Agent walks the
//! same fixed sequence:
//!
//! 1. **recover** — panics in the handler are caught and mapped to
//!    `Internal`; the audit stage still fires.
//! 2. **authenticate** — the peer's verified leaf certificate yields the
//!    identity; the registered auth plugin may refine or reject it.
//! 3. **authorize** — the registered policy plugin evaluates
//!    `(identity, action, resource)`; a deny or error becomes
//!    `PermissionDenied` carrying the plugin's reason.
//! 4. **handler** — the actual RPC logic.
//! 5. **audit** — fires after the handler regardless of outcome, to every
//!    audit plugin; it can never fail the call.
//!
//! Handlers call [`Pipeline::begin`] with the resource they derived from the
//! request, run their logic under [`Pipeline::unary`], or carry the returned
//! [`CallGuard`] into a streaming task and finish it at stream termination.
//!
//! Authentication and authorization failures are audited too, with
//! `result = "error"` and no request body.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tonic::{Request, Response, Status};
use tracing::{error, warn};

use crate::registry::Registry;
use crate::types::{Action, AuditEntry, AuthRequest, Identity, PolicyRequest, Resource};

/// Shared entry point for the interceptor chain.
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<Registry>,
    /// Agent id stamped on audit entries; empty on the Control Node.
    agent_id: String,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, agent_id: impl Into<String>) -> Self {
        Self {
            registry,
            agent_id: agent_id.into(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Extract the caller identity from the verified peer chain. Absence of
    /// a verified chain is an authentication failure.
    fn identity_from_certs<T>(&self, request: &Request<T>) -> Result<Identity, Status> {
        let certs = request
            .peer_certs()
            .ok_or_else(|| Status::unauthenticated("no verified peer certificate"))?;
        let leaf = certs
            .first()
            .ok_or_else(|| Status::unauthenticated("empty peer certificate chain"))?;
        let principal = mandau_transport::leaf_common_name(leaf.as_ref())
            .ok_or_else(|| Status::unauthenticated("peer certificate has no common name"))?;

        let mut identity = Identity::new(principal);
        identity.certificate = leaf.as_ref().to_vec();
        Ok(identity)
    }

    /// Run authenticate and authorize for one call. On success returns a
    /// [`CallGuard`] that must be finished when the handler (or stream)
    /// completes; on failure the attempt has already been audited.
    pub async fn begin<T>(
        &self,
        request: &Request<T>,
        method: &str,
        verb: &str,
        resource: Resource,
    ) -> Result<CallGuard, Status> {
        let start = Instant::now();

        let identity = match self.identity_from_certs(request) {
            Ok(identity) => identity,
            Err(status) => {
                self.audit_attempt(None, method, &resource, start).await;
                return Err(status);
            }
        };

        let identity = match self.registry.auth() {
            Some(auth) => {
                let req = AuthRequest {
                    identity: identity.clone(),
                    method: method.to_string(),
                };
                match auth.authenticate(&req).await {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(method, principal = %identity.principal_id, error = %e,
                            "authentication rejected");
                        self.audit_attempt(Some(identity), method, &resource, start)
                            .await;
                        return Err(Status::unauthenticated("authentication failed"));
                    }
                }
            }
            None => identity,
        };

        if let Some(policy) = self.registry.policy() {
            let req = PolicyRequest {
                identity: identity.clone(),
                action: Action::new(method, verb, resource.qualified()),
                resource: resource.clone(),
            };
            let decision = match policy.evaluate(&req).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.audit_attempt(Some(identity), method, &resource, start)
                        .await;
                    return Err(Status::permission_denied(format!("access denied: {e}")));
                }
            };
            if !decision.allowed {
                warn!(method, principal = %identity.principal_id, reason = %decision.reason,
                    "policy denied");
                self.audit_attempt(Some(identity), method, &resource, start)
                    .await;
                return Err(Status::permission_denied(format!(
                    "access denied: {}",
                    decision.reason
                )));
            }
        }

        Ok(CallGuard {
            registry: self.registry.clone(),
            agent_id: self.agent_id.clone(),
            identity,
            method: method.to_string(),
            resource: resource.qualified(),
            metadata: resource.labels,
            start,
        })
    }

    /// Run a unary handler under the panic barrier, then audit.
    pub async fn unary<T, F>(&self, guard: CallGuard, handler: F) -> Result<Response<T>, Status>
    where
        F: std::future::Future<Output = Result<Response<T>, Status>>,
    {
        let outcome = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(method = %guard.method, "panic in handler");
                Err(Status::internal("internal error"))
            }
        };
        guard.finish(outcome.is_ok()).await;
        outcome
    }

    /// Audit a failed authentication or authorization attempt. No request
    /// body is recorded, only the attempt itself.
    async fn audit_attempt(
        &self,
        identity: Option<Identity>,
        method: &str,
        resource: &Resource,
        start: Instant,
    ) {
        self.registry
            .audit_all(&AuditEntry {
                timestamp: chrono::Utc::now(),
                agent_id: self.agent_id.clone(),
                identity,
                action: method.to_string(),
                resource: resource.qualified(),
                result: "error".to_string(),
                duration: start.elapsed(),
                metadata: HashMap::new(),
            })
            .await;
    }
}

/// Records the audit entry for one authorized call. Streaming handlers carry
/// the guard into the forwarding task and finish it when the stream ends, so
/// the entry covers the full stream duration.
pub struct CallGuard {
    registry: Arc<Registry>,
    agent_id: String,
    identity: Identity,
    method: String,
    resource: String,
    metadata: HashMap<String, String>,
    start: Instant,
}

impl std::fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard")
            .field("agent_id", &self.agent_id)
            .field("identity", &self.identity)
            .field("method", &self.method)
            .field("resource", &self.resource)
            .field("metadata", &self.metadata)
            .field("start", &self.start)
            .finish()
    }
}

impl CallGuard {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Emit the audit entry for this call.
    pub async fn finish(self, ok: bool) {
        self.registry
            .audit_all(&AuditEntry {
                timestamp: chrono::Utc::now(),
                agent_id: self.agent_id,
                identity: Some(self.identity),
                action: self.method,
                resource: self.resource,
                result: if ok { "success" } else { "error" }.to_string(),
                duration: self.start.elapsed(),
                metadata: self.metadata,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::interface::{
        AuditPlugin, Capability, Plugin, PluginConfig, PluginError, PolicyPlugin,
    };
    use crate::types::{AuditFilter, PolicyDecision};

    struct RecordingAudit {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl Plugin for RecordingAudit {
        fn name(&self) -> &str {
            "recording-audit"
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Audit]
        }
        async fn init(&self, _: Option<&PluginConfig>) -> Result<(), PluginError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[async_trait]
    impl AuditPlugin for RecordingAudit {
        async fn log(&self, entry: &AuditEntry) {
            self.entries.lock().unwrap().push(entry.clone());
        }
        async fn query(&self, _: &AuditFilter) -> Result<Vec<AuditEntry>, PluginError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl Plugin for DenyAll {
        fn name(&self) -> &str {
            "deny-all"
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Policy]
        }
        async fn init(&self, _: Option<&PluginConfig>) -> Result<(), PluginError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PolicyPlugin for DenyAll {
        async fn evaluate(&self, _: &PolicyRequest) -> Result<PolicyDecision, PluginError> {
            Ok(PolicyDecision::deny("nobody gets in"))
        }
    }

    fn pipeline_with(registry: Registry) -> Pipeline {
        Pipeline::new(Arc::new(registry), "agent-test")
    }

    #[tokio::test]
    async fn missing_peer_certificate_is_unauthenticated_and_audited() {
        let audit = Arc::new(RecordingAudit {
            entries: Mutex::new(Vec::new()),
        });
        let mut registry = Registry::new();
        registry
            .register(crate::registry::PluginHandle::new(audit.clone()).with_audit(audit.clone()))
            .unwrap();
        let pipeline = pipeline_with(registry);

        // A plain request carries no TLS connect info.
        let request = Request::new(());
        let err = pipeline
            .begin(
                &request,
                "/mandau.v1.StackService/ApplyStack",
                "write",
                Resource::new("stack", "web"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::Unauthenticated);
        let entries = audit.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, "error");
        assert!(entries[0].identity.is_none());
    }

    #[tokio::test]
    async fn panic_in_handler_maps_to_internal_and_audits() {
        let audit = Arc::new(RecordingAudit {
            entries: Mutex::new(Vec::new()),
        });
        let mut registry = Registry::new();
        registry
            .register(crate::registry::PluginHandle::new(audit.clone()).with_audit(audit.clone()))
            .unwrap();
        let pipeline = pipeline_with(registry);

        let guard = CallGuard {
            registry: pipeline.registry().clone(),
            agent_id: "agent-test".into(),
            identity: Identity::new("ops@example.com"),
            method: "/mandau.v1.StackService/ApplyStack".into(),
            resource: "stack:web".into(),
            metadata: HashMap::new(),
            start: Instant::now(),
        };

        let result: Result<Response<()>, Status> = pipeline
            .unary(guard, async { panic!("handler exploded") })
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::Internal);
        let entries = audit.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, "error");
    }

    #[tokio::test]
    async fn deny_policy_reason_is_surfaced() {
        // Policy denial is only reachable once an identity exists, which
        // requires TLS connect info; the decision mapping is covered through
        // the policy plugin directly.
        let deny = DenyAll;
        let decision = deny
            .evaluate(&PolicyRequest {
                identity: Identity::new("ops@example.com"),
                action: Action::new("/m", "write", "stack:web"),
                resource: Resource::new("stack", "web"),
            })
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "nobody gets in");
    }
}
