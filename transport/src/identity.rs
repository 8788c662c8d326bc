// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Principal extraction from verified peer certificates.
//!
//! After the TLS layer has verified the client chain, the leaf subject's
//! common name becomes the caller's principal id. Everything downstream
//! (authentication plugins, policy, audit) keys off that string.

use x509_parser::prelude::*;

/// Extract the subject common name from a DER-encoded leaf certificate.
///
/// Returns `None` when the certificate cannot be parsed or carries no CN;
/// callers treat that as an unauthenticated peer.
pub fn leaf_common_name(der: &[u8]) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(der).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(cn: &str) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        cert.der().to_vec()
    }

    #[test]
    fn extracts_common_name() {
        let der = self_signed("ops@example.com");
        assert_eq!(leaf_common_name(&der).as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn garbage_der_yields_none() {
        assert_eq!(leaf_common_name(b"not a certificate"), None);
    }
}
