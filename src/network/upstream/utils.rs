/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Connection establishment helpers
//!
//! Provides helper functions for:
//! - TCP connects (direct or through a proxy)
//! - TLS handshakes over any byte stream
//! - QUIC endpoint and connection setup

use crate::core::error::{DnsError, Result};
use crate::network::tls_config::client_config;
use crate::network::transport::AsyncStream;
use crate::network::upstream::ServerIdentity;
use crate::network::upstream::proxy::ProxyRef;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, EndpointConfig, TokioRuntime};
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Open a TCP stream with TCP_NODELAY enabled
///
/// TCP_NODELAY matters for DNS over TCP: queries are small and must not
/// wait for Nagle coalescing.
pub(crate) async fn connect_tcp(addr: SocketAddr, conn_timeout: Duration) -> Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let _ = socket.set_nodelay(true);

    match timeout(conn_timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(DnsError::Io(e)),
        Err(_) => Err(DnsError::transport(format!("TCP connect to {addr} timed out"))),
    }
}

/// Byte stream to `server`, through `proxy` when one is set
pub(crate) async fn connect_stream(
    server: &ServerIdentity,
    proxy: &ProxyRef,
    conn_timeout: Duration,
) -> Result<Box<dyn AsyncStream>> {
    match proxy.get() {
        Some(proxy) => match timeout(conn_timeout, proxy.connect(server.addr)).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::transport(format!(
                "Proxy connect to {} timed out",
                server.addr
            ))),
        },
        None => Ok(Box::new(connect_tcp(server.addr, conn_timeout).await?)),
    }
}

/// Establish TLS over an existing byte stream
///
/// `server_name` drives SNI and certificate checks; literal addresses are
/// accepted. Setting `insecure` disables certificate validation and makes
/// the connection vulnerable to man-in-the-middle attacks.
pub(crate) async fn connect_tls<S>(
    stream: S,
    insecure: bool,
    server_name: &str,
    conn_timeout: Duration,
    alpn: &[&[u8]],
) -> Result<TlsStream<S>>
where
    S: AsyncStream,
{
    let config = client_config(insecure, alpn)?;
    let connector = TlsConnector::from(Arc::new(config));
    let dns_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| DnsError::config(format!("Invalid TLS server name: {server_name}")))?;

    match timeout(conn_timeout, connector.connect(dns_name, stream)).await {
        Ok(Ok(s)) => Ok(s),
        Ok(Err(e)) => Err(DnsError::transport(format!("TLS connection error: {}", e))),
        Err(_) => Err(DnsError::transport("TLS handshake timeout")),
    }
}

/// Unspecified local address of the same family as `remote`
pub(crate) fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Bind a non-blocking std UDP socket at `local`
pub(crate) fn bind_udp(local: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if local.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(socket.into())
}

/// Create a QUIC endpoint on `socket` and connect to `remote`
///
/// The endpoint is returned alongside the connection and must outlive it.
pub(crate) async fn connect_quic(
    socket: UdpSocket,
    remote: SocketAddr,
    insecure: bool,
    server_name: &str,
    conn_timeout: Duration,
    alpn: &[&[u8]],
) -> Result<(Endpoint, quinn::Connection)> {
    let mut endpoint = Endpoint::new(
        EndpointConfig::default(),
        None,
        socket,
        Arc::new(TokioRuntime),
    )?;

    let tls = client_config(insecure, alpn)?;
    let client_config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls)?));
    endpoint.set_default_client_config(client_config);

    match timeout(conn_timeout, endpoint.connect(remote, server_name)?).await {
        Ok(Ok(conn)) => {
            debug!(remote = %remote, server_name, "QUIC handshake complete");
            Ok((endpoint, conn))
        }
        Ok(Err(e)) => Err(DnsError::transport(format!("QUIC connection error: {}", e))),
        Err(_) => Err(DnsError::transport("QUIC handshake timeout")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_tcp_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let stream = connect_tcp(addr, Duration::from_secs(2)).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(accept.await.unwrap());
    }

    #[test]
    fn bind_udp_matches_family() {
        let v4 = bind_udp(unspecified_for(&"192.0.2.1:53".parse().unwrap())).unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());
        assert_ne!(v4.local_addr().unwrap().port(), 0);
    }
}
