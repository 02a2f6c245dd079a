/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Every field has a default so an empty YAML document (or
//! `TransportOptions::default()`) yields a working configuration.

use crate::core::error::StaleReason;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Every source port is excluded")]
    AllPortsExcluded,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Top-level document accepted by [`crate::config::load`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// Transport layer tuning
    #[serde(default)]
    pub transport: TransportOptions,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }
        self.transport.validate()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Tuning knobs for connections, pooling and the datagram socket pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Idle window after which pooled connections are swept (seconds)
    pub idle_expiry_secs: u64,

    /// Stream reader idle timeout; the stream is torn down when it expires (seconds)
    pub stream_idle_timeout_secs: u64,

    /// Upper bound for TCP/TLS/QUIC connection establishment (milliseconds)
    pub connect_timeout_ms: u64,

    /// Skip TLS certificate verification (**INSECURE**, testing only)
    pub insecure_skip_verify: bool,

    /// Datagram socket pool settings
    pub socket_pool: SocketPoolConfig,

    /// Which first-attempt transport failures get one free retry
    pub stale_policy: StalePolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            idle_expiry_secs: 15 * 60,
            stream_idle_timeout_secs: 120,
            connect_timeout_ms: 5_000,
            insecure_skip_verify: false,
            socket_pool: SocketPoolConfig::default(),
            stale_policy: StalePolicy::default(),
        }
    }
}

impl TransportOptions {
    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_expiry_secs == 0 {
            return Err(ConfigError::ZeroDuration("idle_expiry_secs"));
        }
        if self.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("stream_idle_timeout_secs"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("connect_timeout_ms"));
        }
        self.socket_pool.validate()
    }
}

/// Datagram socket pool settings
///
/// One pool is built per address family. Each pooled socket is bound to a
/// source address picked at random from the family's list (the unspecified
/// address when the list is empty) and an ephemeral port outside
/// `excluded_ports`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketPoolConfig {
    /// Number of pre-bound sockets per address family (0 disables pooling)
    pub size: usize,

    /// Source ports that must never be used
    pub excluded_ports: HashSet<u16>,

    /// Candidate IPv4 source addresses
    pub ipv4_sources: Vec<Ipv4Addr>,

    /// Candidate IPv6 source addresses
    pub ipv6_sources: Vec<Ipv6Addr>,
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        Self {
            size: 32,
            excluded_ports: HashSet::new(),
            ipv4_sources: Vec::new(),
            ipv6_sources: Vec::new(),
        }
    }
}

impl SocketPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Port 0 never reaches the check, so the full range is 1..=65535.
        if self.excluded_ports.iter().filter(|p| **p != 0).count() >= u16::MAX as usize {
            return Err(ConfigError::AllPortsExcluded);
        }
        Ok(())
    }
}

/// Set of transport failure reasons that trigger the untracked
/// first-attempt retry
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct StalePolicy {
    reasons: HashSet<StaleReason>,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            reasons: HashSet::from([
                StaleReason::ConnectionIdle,
                StaleReason::HostUnreachable,
                StaleReason::TunnelClosed,
            ]),
        }
    }
}

impl StalePolicy {
    pub fn new(reasons: impl IntoIterator<Item = StaleReason>) -> Self {
        Self {
            reasons: reasons.into_iter().collect(),
        }
    }

    /// Policy that never grants the extra attempt
    pub fn disabled() -> Self {
        Self {
            reasons: HashSet::new(),
        }
    }

    pub fn allows(&self, reason: Option<StaleReason>) -> bool {
        reason.is_some_and(|r| self.reasons.contains(&r))
    }
}
