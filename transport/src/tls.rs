// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Certificate loading and tonic TLS configuration.
//!
//! A certificate load failure is fatal at startup, so these functions return
//! errors that the binaries propagate straight out of `main`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("read {}: {}", .path.display(), .source)]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid dial address: {0}")]
    InvalidAddress(String),

    #[error("tls handshake configuration: {0}")]
    Handshake(String),
}

/// Paths to the PEM material a Mandau process needs: its own certificate and
/// key, plus the shared CA used to verify the peer.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl TlsPaths {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Server-side mTLS: present our chain, require and verify a client chain
/// against the shared CA. rustls negotiates TLS 1.3 with its AEAD suites.
pub fn server_tls_config(paths: &TlsPaths) -> Result<ServerTlsConfig, TlsError> {
    let cert = read_pem(&paths.cert_path)?;
    let key = read_pem(&paths.key_path)?;
    let ca = read_pem(&paths.ca_path)?;

    debug!(cert = %paths.cert_path.display(), "loaded server certificate");

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

/// Client-side mTLS: present our chain, verify the server against the shared
/// CA, and pin the expected server name (`mandau-core` or `mandau-agent`).
pub fn client_tls_config(paths: &TlsPaths, server_name: &str) -> Result<ClientTlsConfig, TlsError> {
    let cert = read_pem(&paths.cert_path)?;
    let key = read_pem(&paths.key_path)?;
    let ca = read_pem(&paths.ca_path)?;

    Ok(ClientTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .ca_certificate(Certificate::from_pem(ca))
        .domain_name(server_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_is_an_error() {
        let paths = TlsPaths::new("/nonexistent/a.crt", "/nonexistent/a.key", "/nonexistent/ca.crt");
        let err = server_tls_config(&paths).unwrap_err();
        assert!(matches!(err, TlsError::ReadFile { .. }));
    }

    #[test]
    fn client_config_requires_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("agent.crt");
        std::fs::write(&cert, b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").unwrap();

        let paths = TlsPaths::new(&cert, dir.path().join("missing.key"), &cert);
        assert!(client_tls_config(&paths, "mandau-core").is_err());
    }
}
