// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! mTLS transport plumbing shared by the Control Node and the Host Agent.
//!
//! Both processes terminate mutually-authenticated TLS and dial each other
//! with a pinned server name. This crate owns certificate loading, the tonic
//! TLS configuration for both directions, outbound endpoint assembly
//! (keepalive, connect timeout, message caps), and extraction of the peer's
//! principal from the verified leaf certificate.

pub mod backoff;
pub mod identity;
pub mod tls;

pub use backoff::{connect_with_backoff, Backoff};
pub use identity::leaf_common_name;
pub use tls::{client_tls_config, server_tls_config, TlsError, TlsPaths};

use std::time::Duration;

use tonic::transport::{ClientTlsConfig, Endpoint};

/// Server name agents expect when dialing the Control Node.
pub const CORE_SERVER_NAME: &str = "mandau-core";

/// Server name the Control Node expects when reverse-dialing an agent.
pub const AGENT_SERVER_NAME: &str = "mandau-agent";

/// Maximum gRPC message size in either direction (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Port agents listen on for reverse-dialed connections.
pub const AGENT_PORT: u16 = 8444;

/// Build an outbound endpoint with the connection policy used everywhere a
/// Mandau process dials another: 5 s minimum connect timeout and aggressive
/// keepalive so dead half-open sockets are noticed within seconds. Retry
/// pacing between failed dials comes from [`backoff::connect_with_backoff`].
pub fn endpoint(addr: String, tls: ClientTlsConfig) -> Result<Endpoint, TlsError> {
    let uri = format!("https://{addr}");
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| TlsError::InvalidAddress(e.to_string()))?
        .tls_config(tls)
        .map_err(|e| TlsError::Handshake(e.to_string()))?
        .connect_timeout(Duration::from_secs(5))
        .tcp_keepalive(Some(Duration::from_secs(10)))
        .http2_keep_alive_interval(Duration::from_secs(10))
        .keep_alive_timeout(Duration::from_secs(5))
        .keep_alive_while_idle(true);
    Ok(endpoint)
}
