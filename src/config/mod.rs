/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration module
//!
//! Loads the optional YAML document carrying logging and transport tuning.
//! Library users can also build [`TransportOptions`] directly.

use crate::core::error::Result;
use std::fs;
use std::path::Path;
use tracing::debug;

mod types;

pub use types::{Config, ConfigError, LogConfig, SocketPoolConfig, StalePolicy, TransportOptions};

/// Load and validate configuration from a YAML file
pub fn load(file: impl AsRef<Path>) -> Result<Config> {
    let string = fs::read_to_string(file.as_ref())?;
    parse(&string)
}

/// Parse and validate configuration from a YAML string
pub fn parse(yaml: &str) -> Result<Config> {
    let config: Config = if yaml.trim().is_empty() {
        Config::default()
    } else {
        serde_yml::from_str(yaml)?
    };
    config.validate()?;

    debug!(
        pool_size = config.transport.socket_pool.size,
        idle_expiry_secs = config.transport.idle_expiry_secs,
        "Transport configuration loaded"
    );
    Ok(config)
}
