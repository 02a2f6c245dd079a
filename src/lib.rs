/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Client-side DNS transport layer
//!
//! Sends DNS requests over UDP, TCP, DNS-over-TLS, DNS-over-HTTPS (wire and
//! JSON, HTTP/2 or HTTP/3) and DNS-over-QUIC, optionally through a proxy.
//! Expensive resources (sockets, streams, TLS and QUIC sessions) are shared
//! through an explicitly owned [`ConnectionRegistry`].

pub mod config;
pub mod core;
pub mod network;

pub use crate::config::{Config, SocketPoolConfig, StalePolicy, TransportOptions};
pub use crate::core::error::{DnsError, Result, StaleReason};
pub use crate::network::upstream::pool::ConnectionRegistry;
pub use crate::network::upstream::proxy::{Proxy, ProxyRef, Socks5Proxy};
pub use crate::network::upstream::{
    Connection, Request, Response, ServerIdentity, TransportKind,
};
