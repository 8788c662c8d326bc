// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Plugin framework for Mandau.
//!
//! Capability providers (authentication, policy, audit, secrets) are bound by
//! name and dispatched through a registry that indexes typed views at
//! registration time. The per-RPC interceptor pipeline lives here too, since
//! it is nothing but an ordered walk over the registered capabilities:
//!
//! ```text
//! recover -> authenticate -> authorize -> handler -> audit
//! ```
//!
//! Built-in providers cover the capabilities the core depends on: RBAC
//! (auth + policy), newline-delimited JSON file audit, and a local secrets
//! store used for `${secret:...}` environment injection.

pub mod builtin;
pub mod interface;
pub mod pipeline;
pub mod registry;
pub mod types;

pub use interface::{AuditPlugin, AuthPlugin, Capability, Plugin, PolicyPlugin, SecretsPlugin};
pub use pipeline::{CallGuard, Pipeline};
pub use registry::{PluginHandle, Registry};
pub use types::{
    Action, AuditEntry, AuditFilter, AuthRequest, Identity, PolicyDecision, PolicyRequest, Resource,
};
