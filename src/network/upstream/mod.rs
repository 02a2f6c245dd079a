/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream DNS transport infrastructure
//!
//! # Supported Protocols
//! - **UDP**: datagrams over a shared socket pool (port 53)
//! - **TCP**: persistent, multiplexed stream (port 53)
//! - **DoT**: TCP stream wrapped in TLS (port 853)
//! - **DoH**: wire format POST over HTTP/2 or HTTP/3 (port 443)
//! - **JSON DoH**: GET with query parameters, JSON body (port 443)
//! - **DoQ**: one QUIC stream per query (port 853)
//!
//! # Connection Management
//! Every transport implements [`Connection`]: one `query` call runs the retry
//! loop, drives the transport and validates the answer. Stream, HTTP and QUIC
//! connections are shared through the [`pool::ConnectionRegistry`]; datagram
//! connections are created per caller and share sockets instead.

use crate::core::app_clock::AppClock;
use crate::core::error::{DnsError, Result};
use async_trait::async_trait;
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::{Host, Url};

mod message;
pub mod pool;
pub mod proxy;
mod query;
mod utils;
pub mod validator;
pub mod xfr;

#[cfg(test)]
pub(crate) mod test_support;

pub use message::{Request, Response, MAX_UDP_PAYLOAD, MIN_UDP_PAYLOAD};
pub use proxy::ProxyRef;
pub use xfr::{ZoneTransferAssembler, ZoneTransferKind};

/// Supported upstream transport kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Https,
    Json,
    Quic,
}

impl TransportKind {
    /// Returns the default port for each transport kind
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 53,
            TransportKind::Tls | TransportKind::Quic => 853,
            TransportKind::Https | TransportKind::Json => 443,
        }
    }

    /// Canonical URL scheme
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Https => "https",
            TransportKind::Json => "https+json",
            TransportKind::Quic => "quic",
        }
    }
}

/// How a URL scheme maps onto a transport
struct SchemeInfo {
    kind: TransportKind,
    /// `Some(secure)` for HTTP based transports
    http: Option<bool>,
    http3: bool,
}

fn scheme_info(scheme: &str) -> Option<SchemeInfo> {
    let (kind, http, http3) = match scheme {
        "udp" => (TransportKind::Udp, None, false),
        "tcp" => (TransportKind::Tcp, None, false),
        "tls" | "dot" => (TransportKind::Tls, None, false),
        "quic" | "doq" => (TransportKind::Quic, None, false),
        "https" | "doh" => (TransportKind::Https, Some(true), false),
        "http" => (TransportKind::Https, Some(false), false),
        "h3" => (TransportKind::Https, Some(true), true),
        "json" | "https+json" => (TransportKind::Json, Some(true), false),
        "http+json" => (TransportKind::Json, Some(false), false),
        _ => return None,
    };
    Some(SchemeInfo { kind, http, http3 })
}

/// Identity of a remote DNS server, used as a pool key
///
/// Immutable once constructed; equality and hashing cover every field, so
/// two identities built from the same URL (and resolving to the same
/// address) share pooled connections.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    /// Transport used to reach the server
    pub kind: TransportKind,
    /// Host name or literal address, used for SNI and certificate checks
    pub host: String,
    /// Resolved socket address
    pub addr: SocketAddr,
    /// Full request URL for HTTP based transports
    pub endpoint: Option<Url>,
    /// Whether the endpoint asked for HTTP/3
    pub http3: bool,
}

impl ServerIdentity {
    /// Identity for a literal socket address
    ///
    /// HTTP based kinds get an `https://<addr>/dns-query` (or `/resolve`)
    /// endpoint.
    pub fn from_socket_addr(kind: TransportKind, addr: SocketAddr) -> Self {
        let host = addr.ip().to_string();
        let endpoint = match kind {
            TransportKind::Https | TransportKind::Json => {
                build_endpoint(true, &addr.ip().to_string(), addr.port(), default_path(kind), None)
                    .ok()
            }
            _ => None,
        };
        Self {
            kind,
            host,
            addr,
            endpoint,
            http3: false,
        }
    }

    /// Parse a server URL and resolve its host
    ///
    /// Accepted forms: `udp://`, `tcp://`, `tls://`, `https://`, `http://`,
    /// `h3://`, `json://`, `https+json://`, `http+json://`, `quic://`,
    /// `doq://`, or a bare `host[:port]` meaning UDP.
    pub async fn parse(addr: &str) -> Result<Self> {
        let target = ParsedTarget::parse(addr)?;
        let resolved = match target.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, target.port),
            Err(_) => resolve_host(&target.host, target.port).await?,
        };
        debug!(
            kind = ?target.kind,
            host = %target.host,
            addr = %resolved,
            "Resolved upstream server identity"
        );
        Ok(Self {
            kind: target.kind,
            host: target.host,
            addr: resolved,
            endpoint: target.endpoint,
            http3: target.http3,
        })
    }

    /// Parse a server URL whose host is already known to be at `addr`
    pub fn with_addr(url: &str, addr: SocketAddr) -> Result<Self> {
        let target = ParsedTarget::parse(url)?;
        Ok(Self {
            kind: target.kind,
            host: target.host,
            addr,
            endpoint: target.endpoint,
            http3: target.http3,
        })
    }

    /// Whether the HTTP endpoint uses TLS
    pub fn is_secure_http(&self) -> bool {
        self.endpoint
            .as_ref()
            .is_some_and(|url| url.scheme() == "https")
    }
}

impl Display for ServerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.endpoint {
            Some(url) if self.http3 => write!(f, "h3+{url}"),
            Some(url) => write!(f, "{url}"),
            None => write!(f, "{}://{}", self.kind.scheme(), self.addr),
        }
    }
}

fn default_path(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Json => "/resolve",
        _ => "/dns-query",
    }
}

fn build_endpoint(
    secure: bool,
    host: &str,
    port: u16,
    path: &str,
    query: Option<&str>,
) -> Result<Url> {
    let scheme = if secure { "https" } else { "http" };
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let mut raw = format!("{scheme}://{host}:{port}{path}");
    if let Some(query) = query {
        raw.push('?');
        raw.push_str(query);
    }
    Url::parse(&raw).map_err(|e| DnsError::config(format!("Invalid endpoint URL {raw}: {e}")))
}

async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| {
        DnsError::config(format!("System DNS returned no addresses for '{}'", host))
    })
}

/// Scheme, host, port and endpoint extracted from a server URL
struct ParsedTarget {
    kind: TransportKind,
    host: String,
    port: u16,
    endpoint: Option<Url>,
    http3: bool,
}

impl ParsedTarget {
    fn parse(addr: &str) -> Result<Self> {
        if !addr.contains("://") {
            return Self::parse(&format!("udp://{addr}"));
        }

        let url = Url::parse(addr)
            .map_err(|e| DnsError::config(format!("Invalid upstream URL '{addr}': {e}")))?;
        let info = scheme_info(url.scheme()).ok_or_else(|| {
            DnsError::config(format!("Unsupported upstream URL scheme: {}", url.scheme()))
        })?;

        let host = match url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Domain(domain)) => domain.trim_matches(|c| c == '[' || c == ']').to_string(),
            None => {
                return Err(DnsError::config(format!(
                    "Invalid upstream URL '{addr}': no host specified"
                )));
            }
        };

        let port = match (url.port(), info.http) {
            (Some(port), _) => port,
            (None, Some(false)) => 80,
            (None, _) => info.kind.default_port(),
        };

        let endpoint = match info.http {
            Some(secure) => {
                let path = match url.path() {
                    "" | "/" => default_path(info.kind),
                    path => path,
                };
                Some(build_endpoint(secure, &host, port, path, url.query())?)
            }
            None => None,
        };

        Ok(Self {
            kind: info.kind,
            host,
            port,
            endpoint,
            http3: info.http3,
        })
    }
}

/// State every connection carries regardless of transport
#[derive(Debug)]
pub struct ConnectionState {
    /// Unique connection ID for logging/tracing
    id: u16,
    server: ServerIdentity,
    proxy: ProxyRef,
    /// Timestamp (ms, [`AppClock`]) of the last `query` call
    last_queried: AtomicU64,
    /// Set while the registry owns the connection
    pooled: AtomicBool,
}

impl ConnectionState {
    pub fn new(id: u16, server: ServerIdentity, proxy: ProxyRef) -> Self {
        Self {
            id,
            server,
            proxy,
            last_queried: AtomicU64::new(AppClock::elapsed_millis()),
            pooled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn proxy(&self) -> &ProxyRef {
        &self.proxy
    }

    pub(crate) fn touch(&self) {
        self.last_queried
            .store(AppClock::elapsed_millis(), Ordering::Relaxed);
    }
}

/// One upstream transport endpoint
///
/// Implementations are shared by many concurrent callers. `query` runs up to
/// `retries` attempts, each raced against `timeout`; `cancel` aborts the
/// whole call. A successful answer has passed the response validator.
#[async_trait]
pub trait Connection: Send + Sync + Debug + 'static {
    fn state(&self) -> &ConnectionState;

    /// Send `request` and wait for its validated answer
    async fn query(
        &self,
        request: &Request,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Response>;

    /// Release sockets, streams and sessions unconditionally
    ///
    /// The connection stays usable; the next query reconnects.
    fn teardown(&self);

    fn id(&self) -> u16 {
        self.state().id
    }

    fn server(&self) -> &ServerIdentity {
        &self.state().server
    }

    fn proxy(&self) -> &ProxyRef {
        &self.state().proxy
    }

    /// Timestamp (ms) of the last `query` call
    fn last_queried(&self) -> u64 {
        self.state().last_queried.load(Ordering::Relaxed)
    }

    fn is_pooled(&self) -> bool {
        self.state().pooled.load(Ordering::Acquire)
    }

    fn set_pooled(&self, pooled: bool) {
        self.state().pooled.store(pooled, Ordering::Release);
    }

    /// Ordinary disposal: a no-op while the registry owns the connection
    fn close(&self) {
        if !self.is_pooled() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(addr: &str) -> ParsedTarget {
        ParsedTarget::parse(addr).unwrap()
    }

    #[test]
    fn bare_address_is_udp_on_53() {
        let target = parse("8.8.8.8");
        assert_eq!(target.kind, TransportKind::Udp);
        assert_eq!(target.host, "8.8.8.8");
        assert_eq!(target.port, 53);
        assert!(target.endpoint.is_none());
    }

    #[test]
    fn default_ports_per_scheme() {
        assert_eq!(parse("tcp://192.0.2.1").port, 53);
        assert_eq!(parse("tls://dns.google").port, 853);
        assert_eq!(parse("quic://dns.adguard.com").port, 853);
        assert_eq!(parse("doq://dns.adguard.com:8853").port, 8853);
        assert_eq!(parse("https://dns.google/dns-query").port, 443);
        assert_eq!(parse("http+json://127.0.0.1/resolve").port, 80);
    }

    #[test]
    fn http_endpoints_are_normalised() {
        let doh = parse("https://dns.google");
        assert_eq!(doh.kind, TransportKind::Https);
        assert_eq!(
            doh.endpoint.unwrap().as_str(),
            "https://dns.google/dns-query"
        );

        let h3 = parse("h3://dns.google:8443/custom");
        assert!(h3.http3);
        assert_eq!(
            h3.endpoint.unwrap().as_str(),
            "https://dns.google:8443/custom"
        );

        let json = parse("json://[2001:db8::1]");
        assert_eq!(json.kind, TransportKind::Json);
        assert_eq!(json.host, "2001:db8::1");
        assert_eq!(
            json.endpoint.unwrap().as_str(),
            "https://[2001:db8::1]/resolve"
        );
    }

    #[test]
    fn unknown_scheme_is_config_error() {
        let err = ParsedTarget::parse("gopher://example.com").err().unwrap();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[tokio::test]
    async fn literal_addresses_skip_resolution() {
        let server = ServerIdentity::parse("tls://[::1]:8853").await.unwrap();
        assert_eq!(server.addr, "[::1]:8853".parse().unwrap());
        assert_eq!(server.to_string(), "tls://[::1]:8853");
    }

    #[test]
    fn identities_compare_by_value() {
        let addr: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let a = ServerIdentity::from_socket_addr(TransportKind::Tcp, addr);
        let b = ServerIdentity::with_addr("tcp://192.0.2.1", addr).unwrap();
        assert_eq!(a, b);
        let c = ServerIdentity::from_socket_addr(TransportKind::Tls, addr);
        assert_ne!(a, c);
    }

    #[test]
    fn pooled_connection_ignores_close() {
        #[derive(Debug)]
        struct FakeConnection {
            state: ConnectionState,
            torn_down: AtomicBool,
        }

        #[async_trait]
        impl Connection for FakeConnection {
            fn state(&self) -> &ConnectionState {
                &self.state
            }

            async fn query(
                &self,
                _: &Request,
                _: Duration,
                _: u32,
                _: &CancellationToken,
            ) -> Result<Response> {
                Err(DnsError::transport("unused"))
            }

            fn teardown(&self) {
                self.torn_down.store(true, Ordering::SeqCst);
            }
        }

        let server =
            ServerIdentity::from_socket_addr(TransportKind::Tcp, "192.0.2.1:53".parse().unwrap());
        let conn = FakeConnection {
            state: ConnectionState::new(1, server, ProxyRef::none()),
            torn_down: AtomicBool::new(false),
        };
        conn.set_pooled(true);
        conn.close();
        assert!(!conn.torn_down.load(Ordering::SeqCst));
        conn.set_pooled(false);
        conn.close();
        assert!(conn.torn_down.load(Ordering::SeqCst));
    }
}
