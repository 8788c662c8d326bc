// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Mandau Control Node library.
//!
//! The Control Node tracks a dynamic population of host agents (in memory,
//! rebuilt from heartbeats), forwards stack operations to the owning agent
//! over lazily-established mTLS channels, and runs the same interceptor
//! pipeline as the agents over its own RPC surface.

pub mod config;
pub mod registry;
pub mod server;
