/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::config::TransportOptions;
use crate::core::error::{DnsError, Result};
use crate::network::tls_config::ALPN_DOQ;
use crate::network::transport::quic_transport::{QuicTransport, QuicTransportReader};
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::query;
use crate::network::upstream::utils::{bind_udp, connect_quic, unspecified_for};
use crate::network::upstream::xfr::ZoneTransferAssembler;
use crate::network::upstream::{Connection, ConnectionState, ServerIdentity};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use quinn::Endpoint;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// DNS over QUIC (RFC 9250)
///
/// One QUIC session, established lazily and shared by all callers; every
/// query runs on its own bidirectional stream with transaction id 0.
pub struct QuicConnection {
    state: ConnectionState,
    options: Arc<TransportOptions>,
    session: ArcSwapOption<QuicSession>,
    /// Serializes session establishment
    connecting: Mutex<()>,
    sessions: AtomicU64,
}

struct QuicSession {
    transport: QuicTransport,
    _endpoint: Endpoint,
}

impl QuicConnection {
    pub(crate) fn new(
        id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        options: Arc<TransportOptions>,
    ) -> Result<Self> {
        proxy.require_udp("DNS over QUIC")?;
        Ok(Self {
            state: ConnectionState::new(id, server, proxy),
            options,
            session: ArcSwapOption::empty(),
            connecting: Mutex::new(()),
            sessions: AtomicU64::new(0),
        })
    }

    /// QUIC sessions established so far
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    async fn session(&self) -> Result<Arc<QuicSession>> {
        if let Some(session) = self.session.load_full()
            && session.transport.is_open()
        {
            return Ok(session);
        }

        let _connecting = self.connecting.lock().await;
        if let Some(session) = self.session.load_full()
            && session.transport.is_open()
        {
            return Ok(session);
        }

        let server = self.state.server();
        let socket = match self.state.proxy().get() {
            Some(proxy) => proxy.bind_datagram(server.addr).await?,
            None => bind_udp(unspecified_for(&server.addr))?,
        };
        let (endpoint, conn) = connect_quic(
            socket,
            server.addr,
            self.options.insecure_skip_verify,
            &server.host,
            self.options.connect_timeout(),
            &[ALPN_DOQ],
        )
        .await?;

        let session = Arc::new(QuicSession {
            transport: QuicTransport::new(conn),
            _endpoint: endpoint,
        });
        self.sessions.fetch_add(1, Ordering::AcqRel);
        self.session.store(Some(session.clone()));
        info!(conn_id = self.state.id(), server = %server, "QUIC session established");
        Ok(session)
    }

    /// Forget `session` if it is still current and its connection died
    fn drop_if_closed(&self, session: &Arc<QuicSession>) {
        if session.transport.is_open() {
            return;
        }
        let current = self.session.load();
        if (*current)
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, session))
        {
            debug!(conn_id = self.state.id(), "Dropping closed QUIC session");
            self.session.compare_and_swap(&*current, None);
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Response> {
        let session = self.session().await?;
        let result = Self::exchange(&session, request).await;
        if result.is_err() {
            self.drop_if_closed(&session);
        }
        let mut response = result?;
        response.set_id(request.id());
        Ok(response)
    }

    async fn exchange(session: &QuicSession, request: &Request) -> Result<Response> {
        let (mut reader, mut writer) = session.transport.open_bi().await?;
        writer.write_final(&request.wire_message(0)).await?;

        match request.zone_transfer() {
            None => Ok(Response::new(reader.read_message().await?)),
            Some(kind) => read_transfer(&mut reader, ZoneTransferAssembler::new(kind)).await,
        }
    }
}

async fn read_transfer(
    reader: &mut QuicTransportReader,
    mut assembler: ZoneTransferAssembler,
) -> Result<Response> {
    while !assembler.push(reader.read_message().await?) {}
    assembler
        .finish()
        .ok_or_else(|| DnsError::protocol("empty zone transfer"))
}

impl Debug for QuicConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicConnection")
            .field("id", &self.state.id())
            .field("server", &self.state.server().to_string())
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[async_trait]
impl Connection for QuicConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn query(
        &self,
        request: &Request,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.state.touch();
        query::run(
            self.state.server(),
            request,
            timeout,
            retries,
            cancel,
            &self.options.stale_policy,
            move |_| self.attempt(request),
        )
        .await
    }

    fn teardown(&self) {
        if let Some(session) = self.session.swap(None) {
            debug!(conn_id = self.state.id(), "Closing QUIC session");
            session.transport.close(b"teardown");
        }
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::upstream::TransportKind;
    use crate::network::upstream::proxy::{Proxy, Socks5Proxy};
    use crate::network::upstream::test_support::{
        a_record, answer_for, echo_a, query_message, soa_record, spawn_quic_server,
    };
    use futures::future::join_all;
    use hickory_proto::rr::RecordType;
    use std::net::SocketAddr;

    fn connection(addr: SocketAddr) -> QuicConnection {
        let options = TransportOptions {
            insecure_skip_verify: true,
            ..TransportOptions::default()
        };
        QuicConnection::new(
            1,
            ServerIdentity::from_socket_addr(TransportKind::Quic, addr),
            ProxyRef::none(),
            Arc::new(options),
        )
        .unwrap()
    }

    #[test]
    fn proxy_without_udp_is_rejected() {
        let server =
            ServerIdentity::from_socket_addr(TransportKind::Quic, "192.0.2.1:853".parse().unwrap());
        let proxy: Arc<dyn Proxy> = Arc::new(Socks5Proxy::new("127.0.0.1:1080".parse().unwrap()));
        let err = QuicConnection::new(
            1,
            server,
            ProxyRef::new(proxy),
            Arc::new(TransportOptions::default()),
        )
        .unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_server_fails_within_connect_timeout() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let server =
            ServerIdentity::from_socket_addr(TransportKind::Quic, silent.local_addr().unwrap());
        let options = TransportOptions {
            connect_timeout_ms: 200,
            ..TransportOptions::default()
        };
        let conn = QuicConnection::new(1, server, ProxyRef::none(), Arc::new(options)).unwrap();

        let request = Request::new(query_message(1, "example.com.", RecordType::A));
        let err = conn
            .query(&request, Duration::from_secs(2), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected {err:?}");
        assert_eq!(conn.session_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_queries_share_one_session() {
        let (addr, handshakes) = spawn_quic_server(|query| {
            // DoQ always carries id 0 on the wire
            if query.id() != 0 {
                return Vec::new();
            }
            echo_a(query)
        });
        let conn = connection(addr);
        let cancel = CancellationToken::new();

        let requests: Vec<Request> = (0..8u16)
            .map(|i| {
                Request::new(query_message(300 + i, &format!("host{i}.example."), RecordType::A))
            })
            .collect();
        let responses = join_all(
            requests
                .iter()
                .map(|request| conn.query(request, Duration::from_secs(3), 1, &cancel)),
        )
        .await;

        for (request, response) in requests.iter().zip(responses) {
            let response = response.unwrap();
            assert_eq!(response.message().id(), request.id());
            assert_eq!(
                response.message().queries()[0].name(),
                request.message().queries()[0].name()
            );
        }
        assert_eq!(conn.session_count(), 1);
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zone_transfer_reads_every_fragment() {
        let (addr, _) = spawn_quic_server(|query| {
            let fragment = |records| answer_for(&query, records);
            vec![
                fragment(vec![
                    soa_record("example.com.", 9),
                    a_record("a.example.com.", [192, 0, 2, 1]),
                ]),
                fragment(vec![
                    a_record("b.example.com.", [192, 0, 2, 2]),
                    soa_record("example.com.", 9),
                ]),
            ]
        });
        let conn = connection(addr);

        let request = Request::new(query_message(56, "example.com.", RecordType::AXFR));
        let response = conn
            .query(&request, Duration::from_secs(3), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.fragment_count(), 2);
        assert_eq!(response.answers().count(), 4);
        assert!(response.fragments().all(|m| m.id() == 56));
    }

    #[tokio::test]
    async fn teardown_reconnects_on_next_query() {
        let (addr, handshakes) = spawn_quic_server(echo_a);
        let conn = connection(addr);
        let request = Request::new(query_message(5, "example.com.", RecordType::A));
        let cancel = CancellationToken::new();

        conn.query(&request, Duration::from_secs(3), 1, &cancel)
            .await
            .unwrap();
        conn.teardown();
        conn.query(&request, Duration::from_secs(3), 1, &cancel)
            .await
            .unwrap();
        assert_eq!(conn.session_count(), 2);
        assert_eq!(handshakes.load(Ordering::SeqCst), 2);
    }
}
