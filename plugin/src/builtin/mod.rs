// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Built-in capability providers compiled into both binaries.
//!
//! Which of these actually run is configuration: the `plugins.enabled` map
//! names them, and `plugins.configs.<name>` feeds their `init`.

pub mod audit_file;
pub mod rbac;
pub mod secrets;

pub use audit_file::FileAuditPlugin;
pub use rbac::RbacPlugin;
pub use secrets::LocalSecretsPlugin;
