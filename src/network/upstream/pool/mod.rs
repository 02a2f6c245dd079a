/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Connection pooling for DNS upstreams
//!
//! # Connection Types
//! - `conn_udp`: plain UDP over the shared datagram socket pool
//! - `conn_tcp`: plain TCP and DoT, multiplexed on one stream
//! - `conn_doh`: DoH wire format (HTTP/2 or HTTP/3) and DoH JSON
//! - `conn_quic`: DoQ, one QUIC stream per query
//!
//! # Registry
//! [`ConnectionRegistry`] keeps one shared connection per
//! (transport kind, server, proxy) and sweeps the ones left idle longer
//! than the configured expiry window. Datagram connections are cheap and
//! never pooled; the registry owns their socket pools instead.

mod request_map;

pub(crate) mod conn_http;
pub(crate) mod socket_pool;

pub mod conn_doh;
pub mod conn_quic;
pub mod conn_tcp;
pub mod conn_udp;

use crate::config::{SocketPoolConfig, TransportOptions};
use crate::core::app_clock::AppClock;
use crate::core::error::Result;
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::{Connection, ServerIdentity, TransportKind};
use arc_swap::ArcSwapOption;
use conn_doh::{HttpsConnection, JsonConnection};
use conn_quic::QuicConnection;
use conn_tcp::{PlainConnector, StreamConnection, TlsConnector};
use conn_udp::DatagramConnection;
use dashmap::DashMap;
use socket_pool::DatagramSockets;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type ProxyConnections = DashMap<ProxyRef, Arc<dyn Connection>>;
type ServerConnections = DashMap<ServerIdentity, ProxyConnections>;

/// Owner of every shared upstream connection
///
/// Create one per application (or per test) and hand it to whatever issues
/// queries; nothing here is process-global.
#[derive(Debug)]
pub struct ConnectionRegistry {
    options: Arc<TransportOptions>,
    connections: DashMap<TransportKind, ServerConnections>,
    sockets: Arc<DatagramSockets>,
    maintenance: ArcSwapOption<CancellationToken>,
    next_id: AtomicU16,
}

impl ConnectionRegistry {
    pub fn new(options: TransportOptions) -> Self {
        let sockets = Arc::new(DatagramSockets::new(options.socket_pool.clone()));
        Self {
            options: Arc::new(options),
            connections: DashMap::new(),
            sockets,
            maintenance: ArcSwapOption::empty(),
            next_id: AtomicU16::new(1),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Shared connection for `server` through `proxy`, created on first use
    ///
    /// UDP gets a fresh, unpooled connection on every call.
    pub fn get_or_create(
        &self,
        server: &ServerIdentity,
        proxy: &ProxyRef,
    ) -> Result<Arc<dyn Connection>> {
        if server.kind == TransportKind::Udp {
            let conn = DatagramConnection::new(
                self.allocate_id(),
                server.clone(),
                proxy.clone(),
                self.sockets.clone(),
                self.options.stale_policy.clone(),
            )?;
            return Ok(Arc::new(conn));
        }

        // the whole chain of shard locks is held until the insert lands, so
        // a concurrent sweep never prunes a map we are about to fill
        let servers = self.connections.entry(server.kind).or_default();
        let proxies = servers.entry(server.clone()).or_default();
        let conn = proxies
            .entry(proxy.clone())
            .or_try_insert_with(|| self.build(server, proxy))?;
        Ok(conn.value().clone())
    }

    fn build(&self, server: &ServerIdentity, proxy: &ProxyRef) -> Result<Arc<dyn Connection>> {
        let id = self.allocate_id();
        let (server, proxy, options) = (server.clone(), proxy.clone(), self.options.clone());
        let conn: Arc<dyn Connection> = match server.kind {
            TransportKind::Tcp => Arc::new(StreamConnection::new(
                id,
                server,
                proxy,
                PlainConnector,
                options,
            )),
            TransportKind::Tls => Arc::new(StreamConnection::new(
                id,
                server,
                proxy,
                TlsConnector,
                options,
            )),
            TransportKind::Https => Arc::new(HttpsConnection::new(id, server, proxy, options)),
            TransportKind::Json => Arc::new(JsonConnection::new(id, server, proxy, options)),
            TransportKind::Quic => Arc::new(QuicConnection::new(id, server, proxy, options)?),
            TransportKind::Udp => Arc::new(DatagramConnection::new(
                id,
                server,
                proxy,
                self.sockets.clone(),
                options.stale_policy.clone(),
            )?),
        };
        conn.set_pooled(true);
        debug!(conn_id = id, server = %conn.server(), "Pooled new upstream connection");
        Ok(conn)
    }

    fn allocate_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve the pooled connection and run one query on it
    pub async fn query(
        &self,
        server: &ServerIdentity,
        proxy: &ProxyRef,
        request: &Request,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let conn = self.get_or_create(server, proxy)?;
        conn.query(request, timeout, retries, cancel).await
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.connections
            .iter()
            .map(|servers| servers.iter().map(|proxies| proxies.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict connections idle for at least the expiry window
    ///
    /// Returns how many were evicted. Evicted connections are torn down
    /// after they leave the maps.
    pub fn sweep(&self) -> usize {
        let expiry = self.options.idle_expiry().as_millis() as u64;
        let mut evicted: Vec<Arc<dyn Connection>> = Vec::new();

        for servers in self.connections.iter() {
            for proxies in servers.iter() {
                proxies.retain(|_, conn| {
                    let idle = AppClock::millis_since(conn.last_queried()) >= expiry;
                    if idle {
                        evicted.push(conn.clone());
                    }
                    !idle
                });
            }
            servers.retain(|_, proxies| !proxies.is_empty());
        }
        self.connections.retain(|_, servers| !servers.is_empty());

        for conn in &evicted {
            debug!(conn_id = conn.id(), server = %conn.server(), "Evicting idle connection");
            conn.set_pooled(false);
            conn.teardown();
        }
        evicted.len()
    }

    /// Run [`sweep`](Self::sweep) every expiry window until stopped
    ///
    /// Restarting replaces the previous task. The task holds a weak
    /// reference and ends on its own once the registry is dropped.
    pub fn start_maintenance(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.maintenance.swap(Some(Arc::new(token.clone()))) {
            previous.cancel();
        }

        let registry = Arc::downgrade(self);
        let interval = self.options.idle_expiry();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.sweep();
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "Idle connection sweep");
                }
            }
            debug!("Connection maintenance stopped");
        });
    }

    pub fn stop_maintenance(&self) {
        if let Some(token) = self.maintenance.swap(None) {
            token.cancel();
        }
    }

    /// Remove and tear down every pooled connection
    pub fn close_all(&self) {
        let mut drained: Vec<Arc<dyn Connection>> = Vec::new();
        for servers in self.connections.iter() {
            for proxies in servers.iter() {
                drained.extend(proxies.iter().map(|conn| conn.value().clone()));
            }
        }
        self.connections.clear();

        for conn in drained {
            conn.set_pooled(false);
            conn.teardown();
        }
    }

    /// Bind the datagram socket pools with the current settings
    pub fn create_socket_pools(&self) {
        self.sockets.create(self.options.socket_pool.clone());
    }

    /// Release the pooled datagram sockets; UDP queries bind ad hoc meanwhile
    pub fn dispose_socket_pools(&self) {
        self.sockets.dispose();
    }

    /// Replace the datagram socket pools with ones built from `config`
    pub fn recreate_socket_pools(&self, config: SocketPoolConfig) {
        self.sockets.dispose();
        self.sockets.create(config);
    }

    /// Sockets currently held by the datagram pools (both families)
    pub fn pooled_sockets(&self) -> usize {
        let pools = self.sockets.snapshot();
        [socket_pool::Family::V4, socket_pool::Family::V6]
            .into_iter()
            .filter_map(|family| pools.pool(family).map(|pool| pool.len()))
            .sum()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_maintenance();
        self.close_all();
    }
}
