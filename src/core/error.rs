/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling for the transport layer
//!
//! Every operation in the crate returns [`DnsError`]. Variants fall into the
//! classes the retry loop cares about:
//! - transport failures (retried with a fresh connection),
//! - timeouts (retried, surfaced as [`DnsError::NoResponse`]),
//! - validation and spoofing failures (never retried),
//! - configuration errors (raised synchronously, never retried).

use crate::config::ConfigError;
use fast_socks5::SocksError;
use quinn::crypto::rustls::NoInitialCipherSuite;
use quinn::ConnectError;
use serde::Deserialize;
use thiserror::Error;

/// Transport failure classes that may indicate a stale pooled resource
/// rather than a dead server.
///
/// A first-attempt failure carrying one of the reasons enabled in
/// [`crate::config::StalePolicy`] is retried once without consuming the
/// caller's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// The multiplexed connection was closed by its idle timer
    ConnectionIdle,
    /// The network reported the remote host as unreachable
    HostUnreachable,
    /// A reused HTTP tunnel died before the request went through
    TunnelClosed,
}

/// Main error type for the transport layer
#[derive(Debug, Error)]
pub enum DnsError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// JSON response body could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (unsupported transport, proxy without UDP, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network address parsing error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// DNS protocol error (encoding, framing)
    #[error("DNS protocol error: {0}")]
    Protocol(String),

    /// DNS codec error
    #[error("DNS Hickory protocol error: {0}")]
    HickoryProtocol(#[from] hickory_proto::ProtoError),

    /// Connect/read/write failure on the underlying transport
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        reason: Option<StaleReason>,
    },

    /// Every attempt timed out
    #[error("No response from {server}{}", qname_suffix(.qname))]
    NoResponse {
        server: String,
        qname: Option<String>,
    },

    /// The response does not answer the question that was asked
    #[error("Response validation failed: {0}")]
    Validation(String),

    /// Everything matched except the transaction id
    #[error("Possible spoofing: response id {actual} does not match request id {expected}")]
    Spoofing { expected: u16, actual: u16 },

    /// The caller's cancellation signal fired
    #[error("Query cancelled")]
    Cancelled,

    /// Quic connect error
    #[error("quic connect error: {0}")]
    QuicConnectError(#[from] ConnectError),

    /// No initial cipher error
    #[error("No initial cipher error: {0}")]
    NoInitialCipherSuiteError(#[from] NoInitialCipherSuite),

    /// socks5 connect error
    #[error("Socks5 error: {0}")]
    SocksError(#[from] SocksError),

    /// Generic error with custom message
    #[error("{0}")]
    Generic(String),
}

impl DnsError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DnsError::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DnsError::Protocol(msg.into())
    }

    /// Create a transport error without a staleness classification
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        DnsError::Transport {
            message: msg.into(),
            reason: None,
        }
    }

    /// Create a transport error classified as a possibly stale resource
    pub fn stale<S: Into<String>>(msg: S, reason: StaleReason) -> Self {
        DnsError::Transport {
            message: msg.into(),
            reason: Some(reason),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        DnsError::Validation(msg.into())
    }

    /// Whether the retry loop may try again after this error
    ///
    /// Transport-level failures (including raw I/O and codec errors on the
    /// wire) are retryable; validation, spoofing, configuration and
    /// cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DnsError::Transport { .. }
                | DnsError::Io(_)
                | DnsError::Protocol(_)
                | DnsError::HickoryProtocol(_)
                | DnsError::QuicConnectError(_)
                | DnsError::SocksError(_)
        )
    }

    /// Staleness classification of a transport error, if any
    pub fn stale_reason(&self) -> Option<StaleReason> {
        match self {
            DnsError::Transport { reason, .. } => *reason,
            DnsError::Io(e) if e.kind() == std::io::ErrorKind::HostUnreachable => {
                Some(StaleReason::HostUnreachable)
            }
            _ => None,
        }
    }
}

/// Allow conversion from String to DnsError
impl From<String> for DnsError {
    fn from(s: String) -> Self {
        DnsError::Generic(s)
    }
}

/// Allow conversion from &str to DnsError
impl From<&str> for DnsError {
    fn from(s: &str) -> Self {
        DnsError::Generic(s.to_string())
    }
}

/// Allow conversion from ConfigError to DnsError
impl From<ConfigError> for DnsError {
    fn from(e: ConfigError) -> Self {
        DnsError::Config(e.to_string())
    }
}

fn qname_suffix(qname: &Option<String>) -> String {
    qname.as_ref().map(|q| format!(" for {q}")).unwrap_or_default()
}

/// Convenient type alias for Results using DnsError
pub type Result<T> = std::result::Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(DnsError::transport("reset").is_retryable());
        assert!(!DnsError::validation("wrong question").is_retryable());
        assert!(!DnsError::Spoofing { expected: 1, actual: 2 }.is_retryable());
        assert!(!DnsError::config("no udp").is_retryable());
        assert!(!DnsError::Cancelled.is_retryable());
    }

    #[test]
    fn stale_reason_from_io_kind() {
        let err = DnsError::Io(std::io::Error::from(std::io::ErrorKind::HostUnreachable));
        assert_eq!(err.stale_reason(), Some(StaleReason::HostUnreachable));
        assert_eq!(DnsError::transport("x").stale_reason(), None);
    }

    #[test]
    fn no_response_message_names_query() {
        let err = DnsError::NoResponse {
            server: "udp://192.0.2.1:53".to_string(),
            qname: Some("example.com.".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "No response from udp://192.0.2.1:53 for example.com."
        );
    }
}
