/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for secure DNS protocols
//!
//! Provides pre-built TLS configurations for:
//! - Secure mode: validates certificates against the webpki root store
//! - Insecure mode: skips certificate validation (for testing only)
//!
//! Base configurations are lazily initialized and cached; every caller gets
//! a clone with its own ALPN list (`dot`, `h2`, `h3` or `doq`).

use crate::core::error::{DnsError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// ALPN token for DNS over TLS (RFC 7858)
pub const ALPN_DOT: &[u8] = b"dot";
/// ALPN token for DNS over HTTPS on HTTP/2
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN token for DNS over HTTPS on HTTP/3
pub const ALPN_H3: &[u8] = b"h3";
/// ALPN token for DNS over QUIC (RFC 9250)
pub const ALPN_DOQ: &[u8] = b"doq";

lazy_static::lazy_static! {
    /// Secure TLS configuration with certificate validation
    static ref SECURE_CONFIG: std::result::Result<ClientConfig, String> = build_secure_config();

    /// Insecure TLS configuration (no certificate validation)
    static ref INSECURE_CONFIG: std::result::Result<ClientConfig, String> = build_insecure_config();
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build secure TLS client configuration
///
/// Enables early data (0-RTT) for performance.
fn build_secure_config() -> std::result::Result<ClientConfig, String> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?;

    let builder = builder.with_root_certificates({
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        root_store
    });

    let mut config = builder.with_no_client_auth();
    config.enable_early_data = true;
    Ok(config)
}

/// Build insecure TLS client configuration
///
/// **WARNING**: Skips all certificate validation. Use only for testing!
fn build_insecure_config() -> std::result::Result<ClientConfig, String> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();

    config.enable_early_data = true;
    Ok(config)
}

/// Client configuration for one transport
///
/// `insecure` selects the skip-verify base; `alpn` replaces the protocol list.
pub(crate) fn client_config(insecure: bool, alpn: &[&[u8]]) -> Result<ClientConfig> {
    let base = if insecure {
        &*INSECURE_CONFIG
    } else {
        &*SECURE_CONFIG
    };
    let mut config = base
        .clone()
        .map_err(|e| DnsError::config(format!("TLS client configuration unavailable: {e}")))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Certificate verifier that accepts any certificate (INSECURE!)
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_per_call() {
        let dot = client_config(false, &[ALPN_DOT]).unwrap();
        let h2 = client_config(false, &[ALPN_H2]).unwrap();
        assert_eq!(dot.alpn_protocols, vec![b"dot".to_vec()]);
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn insecure_config_builds() {
        let config = client_config(true, &[ALPN_DOQ]).unwrap();
        assert!(config.enable_early_data);
        assert_eq!(config.alpn_protocols, vec![b"doq".to_vec()]);
    }
}
