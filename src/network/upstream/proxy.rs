/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Outbound proxies
//!
//! A [`Proxy`] knows how to reach a target through some intermediary. Pooled
//! connections are keyed by server *and* proxy, so [`ProxyRef`] compares by
//! identity: two references to the same proxy object share connections,
//! two equal-looking proxies do not.

use crate::core::error::{DnsError, Result};
use crate::network::transport::AsyncStream;
use async_trait::async_trait;
use fast_socks5::client::Socks5Stream;
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{AuthenticationMethod, Socks5Command};
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::{Host, Url};

/// Strategy for reaching a server through an intermediary
#[async_trait]
pub trait Proxy: Send + Sync + Debug + 'static {
    /// Open a byte stream to `target`
    async fn connect(&self, target: SocketAddr) -> Result<Box<dyn AsyncStream>>;

    /// Open a byte stream to the host and port of an HTTP endpoint
    async fn create_tunnel(&self, endpoint: &Url) -> Result<Box<dyn AsyncStream>>;

    /// Whether datagrams can be relayed
    fn is_udp_available(&self) -> bool {
        false
    }

    /// Socket whose datagrams reach `target` through the proxy
    ///
    /// Only called when [`Proxy::is_udp_available`] returns `true`.
    async fn bind_datagram(&self, target: SocketAddr) -> Result<std::net::UdpSocket> {
        Err(DnsError::config(format!(
            "proxy {self:?} cannot relay datagrams to {target}"
        )))
    }
}

/// Optional, identity-compared proxy handle
#[derive(Clone, Default)]
pub struct ProxyRef(Option<Arc<dyn Proxy>>);

impl ProxyRef {
    pub fn new(proxy: Arc<dyn Proxy>) -> Self {
        Self(Some(proxy))
    }

    /// Direct connections
    pub fn none() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&Arc<dyn Proxy>> {
        self.0.as_ref()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Fail with a configuration error if a proxy is set but cannot relay UDP
    pub fn require_udp(&self, transport: &str) -> Result<()> {
        match &self.0 {
            Some(proxy) if !proxy.is_udp_available() => Err(DnsError::config(format!(
                "{transport} requires UDP but proxy {proxy:?} does not support it"
            ))),
            _ => Ok(()),
        }
    }

    fn addr(&self) -> usize {
        self.0
            .as_ref()
            .map(|p| Arc::as_ptr(p) as *const () as usize)
            .unwrap_or(0)
    }
}

impl From<Arc<dyn Proxy>> for ProxyRef {
    fn from(proxy: Arc<dyn Proxy>) -> Self {
        ProxyRef::new(proxy)
    }
}

impl PartialEq for ProxyRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl Eq for ProxyRef {}

impl Hash for ProxyRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl Debug for ProxyRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(proxy) => write!(f, "{proxy:?}"),
            None => f.write_str("direct"),
        }
    }
}

/// SOCKS5 proxy (TCP CONNECT only)
///
/// Accepts `host:port` or `username:password@host:port`; host names are
/// resolved once with the system resolver.
#[derive(Clone)]
pub struct Socks5Proxy {
    username: Option<String>,
    password: Option<String>,
    addr: SocketAddr,
}

impl Debug for Socks5Proxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "socks5://{}", self.addr)
    }
}

impl Socks5Proxy {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            username: None,
            password: None,
            addr,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (username, password, host_port) = match raw.rfind('@') {
            Some(at) => {
                let (user, pass) = raw[..at].split_once(':').ok_or_else(|| {
                    DnsError::config(format!(
                        "Invalid SOCKS5 auth format (expected username:password): {raw}"
                    ))
                })?;
                (Some(user.to_string()), Some(pass.to_string()), &raw[at + 1..])
            }
            None => (None, None, raw),
        };

        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
            DnsError::config(format!("Invalid SOCKS5 address (expected host:port): {host_port}"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| DnsError::config(format!("Invalid SOCKS5 port: {port}")))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let ip = match IpAddr::from_str(host) {
            Ok(ip) => ip,
            Err(_) => lookup_host(host)?,
        };

        Ok(Self {
            username,
            password,
            addr: SocketAddr::new(ip, port),
        })
    }

    async fn open(&self, target: TargetAddr) -> Result<Box<dyn AsyncStream>> {
        let proxy_stream = TcpStream::connect(self.addr).await?;
        let _ = proxy_stream.set_nodelay(true);

        let auth = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(AuthenticationMethod::Password {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let mut config = fast_socks5::client::Config::default();
        if auth.is_none() {
            config.set_skip_auth(true);
        }

        let mut socks5_stream = Socks5Stream::use_stream(proxy_stream, auth, config).await?;
        socks5_stream
            .request(Socks5Command::TCPConnect, target)
            .await?;
        let stream = socks5_stream.get_socket();
        let _ = stream.set_nodelay(true);
        debug!(proxy = %self.addr, "SOCKS5 tunnel established");
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Proxy for Socks5Proxy {
    async fn connect(&self, target: SocketAddr) -> Result<Box<dyn AsyncStream>> {
        self.open(TargetAddr::Ip(target)).await
    }

    async fn create_tunnel(&self, endpoint: &Url) -> Result<Box<dyn AsyncStream>> {
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| DnsError::config(format!("No port for endpoint {endpoint}")))?;
        let target = match endpoint.host() {
            Some(Host::Ipv4(ip)) => TargetAddr::Ip(SocketAddr::new(ip.into(), port)),
            Some(Host::Ipv6(ip)) => TargetAddr::Ip(SocketAddr::new(ip.into(), port)),
            Some(Host::Domain(domain)) => TargetAddr::Domain(domain.to_string(), port),
            None => {
                return Err(DnsError::config(format!("No host in endpoint {endpoint}")));
            }
        };
        self.open(target).await
    }
}

/// Blocking system resolution, used once while parsing configuration
fn lookup_host(host: &str) -> Result<IpAddr> {
    let addr = (host, 0)
        .to_socket_addrs()
        .map_err(|e| DnsError::config(format!("System DNS resolution failed for '{host}': {e}")))?
        .next()
        .ok_or_else(|| DnsError::config(format!("System DNS returned no addresses for '{host}'")))?;
    info!(host = %host, resolved_ip = %addr.ip(), "Resolved SOCKS5 proxy host using system DNS");
    Ok(addr.ip())
}
