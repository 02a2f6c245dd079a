/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Pre-bound UDP sockets shared by datagram connections
//!
//! One [`SocketPool`] per address family holds a fixed number of sockets.
//! A caller claims a free slot with a single compare-and-swap, starting at a
//! random index so concurrent callers spread across the pool. When every
//! slot is busy the caller gets a fresh, unpooled socket built with the same
//! binding rules; it is closed on release instead of being returned.

use crate::config::SocketPoolConfig;
use crate::core::error::{DnsError, Result};
use arc_swap::ArcSwap;
use rand::random_range;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Attempts at finding a source port outside the excluded set
const MAX_BIND_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }
}

#[derive(Debug)]
struct Slot {
    socket: Arc<UdpSocket>,
    in_use: AtomicBool,
}

/// Fixed set of sockets for one address family
#[derive(Debug)]
pub(crate) struct SocketPool {
    slots: Vec<Slot>,
}

impl SocketPool {
    /// Bind `config.size` sockets; fails if any single bind fails
    pub fn bind(family: Family, config: &SocketPoolConfig) -> Result<Arc<Self>> {
        let mut slots = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            slots.push(Slot {
                socket: Arc::new(bind_datagram_socket(family, config)?),
                in_use: AtomicBool::new(false),
            });
        }
        Ok(Arc::new(Self { slots }))
    }

    /// Claim a free socket, or `None` when all are busy
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledSocket> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        let start = random_range(0..len);
        for offset in 0..len {
            let index = (start + offset) % len;
            let slot = &self.slots[index];
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PooledSocket {
                    socket: slot.socket.clone(),
                    lease: Some(Lease {
                        pool: self.clone(),
                        index,
                    }),
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::Acquire))
            .count()
    }
}

#[derive(Debug)]
struct Lease {
    pool: Arc<SocketPool>,
    index: usize,
}

/// Exclusive use of one socket until dropped
#[derive(Debug)]
pub struct PooledSocket {
    socket: Arc<UdpSocket>,
    lease: Option<Lease>,
}

impl PooledSocket {
    fn unpooled(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            lease: None,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Whether the socket goes back to a pool on release
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Slot index inside the owning pool
    pub fn index(&self) -> Option<usize> {
        self.lease.as_ref().map(|lease| lease.index)
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(lease) = &self.lease {
            lease.pool.slots[lease.index]
                .in_use
                .store(false, Ordering::Release);
        }
    }
}

/// Bind one UDP socket following the pool's source rules
///
/// The source address is drawn at random from the family's configured list
/// (unspecified when empty). The port is ephemeral; sockets landing on an
/// excluded port are dropped and rebound.
pub(crate) fn bind_datagram_socket(family: Family, config: &SocketPoolConfig) -> Result<UdpSocket> {
    let source = pick_source(family, config);
    for _ in 0..MAX_BIND_ATTEMPTS {
        let socket = Socket::new(Domain::for_address(source), Type::DGRAM, Some(Protocol::UDP))?;
        if family == Family::V6 {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&source.into())?;

        let port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(0);
        if config.excluded_ports.contains(&port) {
            debug!(port, "Rebinding datagram socket away from excluded port");
            continue;
        }
        let std_socket: std::net::UdpSocket = socket.into();
        return Ok(UdpSocket::from_std(std_socket)?);
    }
    Err(DnsError::transport(format!(
        "No usable source port for {source} after {MAX_BIND_ATTEMPTS} attempts"
    )))
}

fn pick_source(family: Family, config: &SocketPoolConfig) -> SocketAddr {
    let ip = match family {
        Family::V4 => match config.ipv4_sources.len() {
            0 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            n => IpAddr::V4(config.ipv4_sources[random_range(0..n)]),
        },
        Family::V6 => match config.ipv6_sources.len() {
            0 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            n => IpAddr::V6(config.ipv6_sources[random_range(0..n)]),
        },
    };
    SocketAddr::new(ip, 0)
}

/// Per-family pools built from one configuration
#[derive(Debug)]
pub(crate) struct SocketPools {
    config: SocketPoolConfig,
    v4: Option<Arc<SocketPool>>,
    v6: Option<Arc<SocketPool>>,
}

impl SocketPools {
    /// Build both families; a family that fails to bind is left out
    pub fn create(config: SocketPoolConfig) -> Self {
        let v4 = Self::create_family(Family::V4, &config);
        let v6 = Self::create_family(Family::V6, &config);
        Self { config, v4, v6 }
    }

    /// No pooled sockets; every acquire binds a fresh one
    pub fn empty(config: SocketPoolConfig) -> Self {
        Self {
            config,
            v4: None,
            v6: None,
        }
    }

    fn create_family(family: Family, config: &SocketPoolConfig) -> Option<Arc<SocketPool>> {
        if config.size == 0 {
            return None;
        }
        match SocketPool::bind(family, config) {
            Ok(pool) => {
                info!(family = ?family, size = pool.len(), "Datagram socket pool ready");
                Some(pool)
            }
            Err(e) => {
                warn!(family = ?family, error = %e, "Datagram socket pool unavailable");
                None
            }
        }
    }

    pub fn pool(&self, family: Family) -> Option<&Arc<SocketPool>> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    /// Socket able to reach `target`: pooled when one is free
    pub fn acquire(&self, target: &SocketAddr) -> Result<PooledSocket> {
        let family = Family::of(target);
        if let Some(socket) = self.pool(family).and_then(|pool| pool.try_acquire()) {
            return Ok(socket);
        }
        debug!(family = ?family, "Datagram socket pool exhausted, binding fresh socket");
        Ok(PooledSocket::unpooled(bind_datagram_socket(
            family,
            &self.config,
        )?))
    }
}

/// Shared handle to the current socket pools
///
/// Pools can be disposed and recreated at runtime; sockets already leased
/// from a replaced pool stay valid until released.
#[derive(Debug)]
pub(crate) struct DatagramSockets {
    current: ArcSwap<SocketPools>,
}

impl DatagramSockets {
    pub fn new(config: SocketPoolConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(SocketPools::create(config)),
        }
    }

    pub fn acquire(&self, target: &SocketAddr) -> Result<PooledSocket> {
        self.current.load().acquire(target)
    }

    pub fn create(&self, config: SocketPoolConfig) {
        self.current.store(Arc::new(SocketPools::create(config)));
    }

    pub fn dispose(&self) {
        let config = self.current.load().config.clone();
        self.current.store(Arc::new(SocketPools::empty(config)));
    }

    pub fn snapshot(&self) -> Arc<SocketPools> {
        self.current.load_full()
    }
}
