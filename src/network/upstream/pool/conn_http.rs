/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared HTTP session for the DoH transports
//!
//! One lazily established session per connection, multiplexing requests:
//! - HTTP/2 over TLS (ALPN `h2`), or over plain TCP with prior knowledge for
//!   `http://` endpoints,
//! - HTTP/3 over QUIC (ALPN `h3`) when the endpoint asks for it and no proxy
//!   is configured.
//!
//! A failed exchange invalidates the session only when the session itself
//! is gone (GOAWAY, I/O failure, closed QUIC connection); a reset stream
//! fails just that request. The next request after an invalidation
//! reconnects.

use crate::config::TransportOptions;
use crate::core::error::{DnsError, Result, StaleReason};
use crate::network::tls_config::{ALPN_H2, ALPN_H3};
use crate::network::transport::AsyncStream;
use crate::network::upstream::ServerIdentity;
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::utils::{bind_udp, connect_quic, connect_stream, connect_tls, unspecified_for};
use arc_swap::ArcSwapOption;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::poll_fn;
use h3_quinn::OpenStreams;
use http::{Request, StatusCode, Version};
use quinn::Endpoint;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Status and body of one exchange
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpReply {
    /// The body, or a transport error for non-2xx statuses
    pub fn into_success(self) -> Result<Bytes> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(DnsError::transport(format!(
                "http unsuccessful code: {}, message: {}",
                self.status,
                String::from_utf8_lossy(&self.body)
            )))
        }
    }
}

enum HttpSender {
    H2(h2::client::SendRequest<Bytes>),
    H3(h3::client::SendRequest<OpenStreams, Bytes>),
}

struct HttpSession {
    sender: HttpSender,
    /// Cancelled when the session dies or is torn down; stops the driver
    shutdown: CancellationToken,
    exchanges: AtomicU64,
    in_flight: AtomicUsize,
    /// QUIC connection under HTTP/3, checked for liveness
    quic: Option<quinn::Connection>,
    /// Keeps the QUIC endpoint alive for HTTP/3
    _endpoint: Option<Endpoint>,
}

impl HttpSession {
    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self
                .quic
                .as_ref()
                .is_none_or(|conn| conn.close_reason().is_none())
    }

    async fn exchange(
        &self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> std::result::Result<HttpReply, ExchangeError> {
        match &self.sender {
            HttpSender::H2(sender) => h2_exchange(sender, request, body).await,
            HttpSender::H3(sender) => h3_exchange(sender, request, body).await,
        }
    }
}

/// Failure of one exchange
struct ExchangeError {
    error: DnsError,
    /// The whole session is unusable, not just this request's stream
    session_lost: bool,
}

impl ExchangeError {
    fn stream(error: DnsError) -> Self {
        Self {
            error,
            session_lost: false,
        }
    }

    fn session(error: DnsError) -> Self {
        Self {
            error,
            session_lost: true,
        }
    }

    /// h3 errors are treated as stream-scoped; a dead connection shows up
    /// through the session liveness check instead
    fn h3(context: &str, e: impl std::fmt::Display) -> Self {
        Self::stream(DnsError::transport(format!("{context}: {e}")))
    }

    fn h2(context: &str, e: h2::Error) -> Self {
        // RST_STREAM carries a reason and is not a GOAWAY
        let session_lost = e.is_go_away() || e.is_io() || e.reason().is_none();
        Self {
            error: DnsError::transport(format!("{context}: {e}")),
            session_lost,
        }
    }
}

/// Decrements the in-flight counter even when the exchange is abandoned
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct HttpClient {
    conn_id: u16,
    server: ServerIdentity,
    proxy: ProxyRef,
    options: Arc<TransportOptions>,
    current: ArcSwapOption<HttpSession>,
    /// Serializes session establishment
    connecting: Mutex<()>,
    sessions: AtomicU64,
}

impl Debug for HttpClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("conn_id", &self.conn_id)
            .field("server", &self.server.to_string())
            .field("http3", &self.uses_http3())
            .finish()
    }
}

impl HttpClient {
    pub fn new(
        conn_id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        options: Arc<TransportOptions>,
    ) -> Self {
        Self {
            conn_id,
            server,
            proxy,
            options,
            current: ArcSwapOption::empty(),
            connecting: Mutex::new(()),
            sessions: AtomicU64::new(0),
        }
    }

    /// HTTP/3 needs raw UDP, so a proxied client falls back to HTTP/2
    pub fn uses_http3(&self) -> bool {
        self.server.http3 && self.proxy.is_none()
    }

    pub fn version(&self) -> Version {
        if self.uses_http3() {
            Version::HTTP_3
        } else {
            Version::HTTP_2
        }
    }

    /// Request URL of the endpoint
    pub fn endpoint(&self) -> Result<&url::Url> {
        self.server
            .endpoint
            .as_ref()
            .ok_or_else(|| DnsError::config(format!("{} has no HTTP endpoint", self.server)))
    }

    /// Sessions established so far
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    /// Send one request over the shared session
    ///
    /// A failure on a session that was reused after going idle is reported
    /// as a stale tunnel so the caller may retry for free.
    pub async fn send(&self, request: Request<()>, body: Option<Bytes>) -> Result<HttpReply> {
        let session = self.session().await?;
        let reused_idle = session.exchanges.load(Ordering::Acquire) > 0
            && session.in_flight.load(Ordering::Acquire) == 0;

        session.in_flight.fetch_add(1, Ordering::AcqRel);
        let result = {
            let _in_flight = InFlight(&session.in_flight);
            session.exchange(request, body).await
        };

        match result {
            Ok(reply) => {
                session.exchanges.fetch_add(1, Ordering::AcqRel);
                Ok(reply)
            }
            Err(ExchangeError {
                error: e,
                session_lost,
            }) => {
                if !session_lost && session.is_alive() {
                    debug!(conn_id = self.conn_id, error = %e, "HTTP stream failed, keeping session");
                    return Err(e);
                }
                self.invalidate(&session);
                if reused_idle {
                    Err(DnsError::stale(
                        format!("reused HTTP session failed: {e}"),
                        StaleReason::TunnelClosed,
                    ))
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn teardown(&self) {
        if let Some(session) = self.current.swap(None) {
            debug!(conn_id = self.conn_id, "Tearing down HTTP session");
            session.shutdown.cancel();
        }
    }

    fn invalidate(&self, session: &Arc<HttpSession>) {
        session.shutdown.cancel();
        let current = self.current.load();
        if current
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, session))
        {
            self.current.compare_and_swap(&*current, None);
        }
    }

    async fn session(&self) -> Result<Arc<HttpSession>> {
        if let Some(session) = self.current.load_full()
            && session.is_alive()
        {
            return Ok(session);
        }

        let _connecting = self.connecting.lock().await;
        if let Some(session) = self.current.load_full()
            && session.is_alive()
        {
            return Ok(session);
        }

        let session = Arc::new(if self.uses_http3() {
            self.connect_h3().await?
        } else {
            self.connect_h2().await?
        });
        self.sessions.fetch_add(1, Ordering::AcqRel);
        self.current.store(Some(session.clone()));
        info!(
            conn_id = self.conn_id,
            server = %self.server,
            http3 = self.uses_http3(),
            "HTTP session established"
        );
        Ok(session)
    }

    async fn connect_h2(&self) -> Result<HttpSession> {
        let connect_timeout = self.options.connect_timeout();
        let stream: Box<dyn AsyncStream> = match self.proxy.get() {
            Some(proxy) => match timeout(connect_timeout, proxy.create_tunnel(self.endpoint()?)).await {
                Ok(result) => result?,
                Err(_) => return Err(DnsError::transport("proxy tunnel timed out")),
            },
            None => connect_stream(&self.server, &ProxyRef::none(), connect_timeout).await?,
        };

        let stream: Box<dyn AsyncStream> = if self.server.is_secure_http() {
            Box::new(
                connect_tls(
                    stream,
                    self.options.insecure_skip_verify,
                    &self.server.host,
                    connect_timeout,
                    &[ALPN_H2],
                )
                .await?,
            )
        } else {
            stream
        };

        let (sender, connection) = match timeout(
            connect_timeout,
            h2::client::Builder::new().handshake::<_, Bytes>(stream),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(DnsError::transport(format!("H2 handshake error: {}", e))),
            Err(_) => return Err(DnsError::transport("H2 handshake timeout")),
        };

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            select! {
                res = connection => {
                    if let Err(e) = res {
                        debug!(conn_id, ?e, "H2 connection error");
                    }
                }
                _ = token.cancelled() => {
                    debug!(conn_id, "H2 connection closed by teardown");
                }
            }
            token.cancel();
        });

        Ok(HttpSession {
            sender: HttpSender::H2(sender),
            shutdown,
            exchanges: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            quic: None,
            _endpoint: None,
        })
    }

    async fn connect_h3(&self) -> Result<HttpSession> {
        let socket = bind_udp(unspecified_for(&self.server.addr))?;
        let (endpoint, quic_conn) = connect_quic(
            socket,
            self.server.addr,
            self.options.insecure_skip_verify,
            &self.server.host,
            self.options.connect_timeout(),
            &[ALPN_H3],
        )
        .await?;

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(quic_conn.clone()))
            .await
            .map_err(|e| DnsError::transport(format!("h3 connection failed: {e}")))?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            select! {
                _ = poll_fn(|cx| driver.poll_close(cx)) => {
                    debug!(conn_id, "H3 connection poll closed");
                }
                _ = token.cancelled() => {
                    debug!(conn_id, "H3 connection closed by teardown");
                }
            }
            token.cancel();
        });

        Ok(HttpSession {
            sender: HttpSender::H3(sender),
            shutdown,
            exchanges: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            quic: Some(quic_conn),
            _endpoint: Some(endpoint),
        })
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn h2_exchange(
    sender: &h2::client::SendRequest<Bytes>,
    request: Request<()>,
    body: Option<Bytes>,
) -> std::result::Result<HttpReply, ExchangeError> {
    let mut sender = sender.clone().ready().await.map_err(|e| {
        ExchangeError::session(DnsError::transport(format!("H2 connection not ready: {e}")))
    })?;

    let (response, mut send_stream) = sender
        .send_request(request, body.is_none())
        .map_err(|e| ExchangeError::h2("H2 send_request error", e))?;
    if let Some(body) = body {
        send_stream
            .send_data(body, true)
            .map_err(|e| ExchangeError::h2("H2 send_data error", e))?;
    }

    let response = response
        .await
        .map_err(|e| ExchangeError::h2("H2 response error", e))?;
    let status = response.status();
    let mut recv = response.into_body();
    let mut data = BytesMut::new();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk.map_err(|e| ExchangeError::h2("H2 body error", e))?;
        let _ = recv.flow_control().release_capacity(chunk.len());
        data.put(chunk);
    }

    Ok(HttpReply {
        status,
        body: data.freeze(),
    })
}

async fn h3_exchange(
    sender: &h3::client::SendRequest<OpenStreams, Bytes>,
    request: Request<()>,
    body: Option<Bytes>,
) -> std::result::Result<HttpReply, ExchangeError> {
    let mut request_stream = sender
        .clone()
        .send_request(request)
        .await
        .map_err(|e| ExchangeError::h3("H3 send_request error", e))?;
    if let Some(body) = body {
        request_stream
            .send_data(body)
            .await
            .map_err(|e| ExchangeError::h3("H3 send_data error", e))?;
    }
    request_stream
        .finish()
        .await
        .map_err(|e| ExchangeError::h3("H3 received a stream error", e))?;

    let response = request_stream
        .recv_response()
        .await
        .map_err(|e| ExchangeError::h3("H3 response error", e))?;

    let mut data = BytesMut::new();
    while let Some(chunk) = request_stream
        .recv_data()
        .await
        .map_err(|e| ExchangeError::h3("h3 recv_data error", e))?
    {
        data.put(chunk);
    }

    Ok(HttpReply {
        status: response.status(),
        body: data.freeze(),
    })
}
