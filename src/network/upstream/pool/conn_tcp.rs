/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::config::TransportOptions;
use crate::core::error::{DnsError, Result, StaleReason};
use crate::network::tls_config::ALPN_DOT;
use crate::network::transport::AsyncStream;
use crate::network::transport::tcp_transport::{TcpTransport, TcpTransportReader, TcpTransportWriter};
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::pool::request_map::RequestMap;
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::query;
use crate::network::upstream::utils::{connect_stream, connect_tls};
use crate::network::upstream::{Connection, ConnectionState, ServerIdentity};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type StreamWriter = TcpTransportWriter<Box<dyn AsyncStream>>;
type StreamReader = TcpTransportReader<Box<dyn AsyncStream>>;

/// How a [`StreamConnection`] obtains its byte stream
#[async_trait]
pub trait StreamConnector: Send + Sync + Debug + 'static {
    async fn connect(
        &self,
        server: &ServerIdentity,
        proxy: &ProxyRef,
        options: &TransportOptions,
    ) -> Result<Box<dyn AsyncStream>>;
}

/// Plain TCP (RFC 1035 length-prefixed framing)
#[derive(Debug, Default)]
pub struct PlainConnector;

#[async_trait]
impl StreamConnector for PlainConnector {
    async fn connect(
        &self,
        server: &ServerIdentity,
        proxy: &ProxyRef,
        options: &TransportOptions,
    ) -> Result<Box<dyn AsyncStream>> {
        connect_stream(server, proxy, options.connect_timeout()).await
    }
}

/// TCP wrapped in TLS (DoT, RFC 7858)
#[derive(Debug, Default)]
pub struct TlsConnector;

#[async_trait]
impl StreamConnector for TlsConnector {
    async fn connect(
        &self,
        server: &ServerIdentity,
        proxy: &ProxyRef,
        options: &TransportOptions,
    ) -> Result<Box<dyn AsyncStream>> {
        let stream = connect_stream(server, proxy, options.connect_timeout()).await?;
        let tls = connect_tls(
            stream,
            options.insecure_skip_verify,
            &server.host,
            options.connect_timeout(),
            &[ALPN_DOT],
        )
        .await?;
        Ok(Box::new(tls))
    }
}

pub type TcpConnection = StreamConnection<PlainConnector>;
pub type TlsConnection = StreamConnection<TlsConnector>;

/// Persistent, multiplexed DNS stream
///
/// Many callers share one byte stream. Writes are serialized by the send
/// lock, which also guards lazy (re)connection. A single reader task per
/// stream routes answers to waiters by transaction id, and tears the stream
/// down when it breaks or stays silent for the idle window. A torn-down
/// stream is replaced on the next query.
pub struct StreamConnection<C: StreamConnector> {
    core: Arc<StreamCore<C>>,
}

struct StreamCore<C> {
    state: ConnectionState,
    connector: C,
    options: Arc<TransportOptions>,
    pending: Arc<RequestMap>,
    /// Send lock; `None` until the first query or after a failure
    live: Mutex<Option<LiveStream>>,
    /// Shutdown signal of the current reader, reachable without the lock
    reader_shutdown: ArcSwapOption<CancellationToken>,
    generation: AtomicU64,
}

struct LiveStream {
    generation: u64,
    writer: StreamWriter,
    shutdown: CancellationToken,
}

impl<C: StreamConnector> StreamConnection<C> {
    pub fn new(
        id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        connector: C,
        options: Arc<TransportOptions>,
    ) -> Self {
        Self {
            core: Arc::new(StreamCore {
                state: ConnectionState::new(id, server, proxy),
                connector,
                options,
                pending: Arc::new(RequestMap::new()),
                live: Mutex::new(None),
                reader_shutdown: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Number of streams opened so far
    pub fn generation(&self) -> u64 {
        self.core.generation.load(Ordering::Acquire)
    }

    /// Transactions waiting for an answer
    pub fn in_flight(&self) -> usize {
        self.core.pending.len()
    }
}

impl<C: StreamConnector> StreamCore<C> {
    async fn attempt(self: &Arc<Self>, request: &Request) -> Result<Response> {
        let mut pending = self.pending.register(request.id(), request.zone_transfer())?;
        let wire = request.wire_message(pending.id());

        // the write runs detached so a caller timing out mid-frame cannot
        // leave a torn frame on the shared stream
        let write = tokio::spawn(self.clone().send(wire));
        match write.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(DnsError::transport(format!("stream writer task failed: {e}")));
            }
        }

        let mut response = pending.wait().await?;
        response.set_id(request.id());
        Ok(response)
    }

    async fn send(self: Arc<Self>, message: Message) -> Result<()> {
        let mut live = self.live.lock().await;

        if live.as_ref().is_none_or(|stream| stream.shutdown.is_cancelled()) {
            *live = Some(self.open().await?);
        }
        let Some(stream) = live.as_mut() else {
            return Err(DnsError::transport("stream unavailable"));
        };

        if let Err(e) = stream.writer.write_message(&message).await {
            warn!(
                conn_id = self.state.id(),
                generation = stream.generation,
                error = %e,
                "Stream write failed, dropping connection"
            );
            stream.shutdown.cancel();
            *live = None;
            self.pending.fail_all(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Connect and start the reader; called with the send lock held
    async fn open(self: &Arc<Self>) -> Result<LiveStream> {
        let server = self.state.server();
        let stream = match timeout(
            self.options.connect_timeout(),
            self.connector.connect(server, self.state.proxy(), &self.options),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(DnsError::transport(format!("connect to {server} timed out")));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shutdown = CancellationToken::new();
        let (reader, writer) = TcpTransport::new(stream).into_split();
        self.reader_shutdown
            .store(Some(Arc::new(shutdown.clone())));
        tokio::spawn(self.clone().read_loop(reader, generation, shutdown.clone()));

        info!(
            conn_id = self.state.id(),
            server = %server,
            generation,
            "Stream connection established"
        );
        Ok(LiveStream {
            generation,
            writer,
            shutdown,
        })
    }

    async fn read_loop(self: Arc<Self>, mut reader: StreamReader, generation: u64, shutdown: CancellationToken) {
        let idle = self.options.stream_idle_timeout();
        let cause = loop {
            select! {
                _ = shutdown.cancelled() => {
                    break DnsError::transport("connection closed");
                }
                read = timeout(idle, reader.read_message()) => match read {
                    Ok(Ok(message)) => {
                        let id = message.id();
                        if !self.pending.dispatch(message) {
                            debug!(conn_id = self.state.id(), id, "Dropping answer nobody waits for");
                        }
                    }
                    Ok(Err(e)) => break e,
                    Err(_) => {
                        break DnsError::stale("stream idle timeout", StaleReason::ConnectionIdle);
                    }
                },
            }
        };

        debug!(conn_id = self.state.id(), generation, cause = %cause, "Stream reader stopped");
        self.abandon(generation, &cause).await;
    }

    /// Drop stream `generation` if it is still the current one
    async fn abandon(&self, generation: u64, cause: &DnsError) {
        let mut live = self.live.lock().await;
        let Some(stream) = live.as_mut() else {
            return;
        };
        if stream.generation != generation {
            return;
        }
        stream.shutdown.cancel();
        stream.writer.shutdown().await;
        *live = None;
        self.pending.fail_all(cause);
    }
}

impl<C: StreamConnector> Debug for StreamConnection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.core.state.id())
            .field("server", &self.core.state.server().to_string())
            .field("connector", &self.core.connector)
            .field("generation", &self.generation())
            .finish()
    }
}

#[async_trait]
impl<C: StreamConnector> Connection for StreamConnection<C> {
    fn state(&self) -> &ConnectionState {
        &self.core.state
    }

    async fn query(
        &self,
        request: &Request,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.core.state.touch();
        let core = &self.core;
        query::run(
            core.state.server(),
            request,
            timeout,
            retries,
            cancel,
            &core.options.stale_policy,
            move |_| core.attempt(request),
        )
        .await
    }

    fn teardown(&self) {
        if let Some(shutdown) = self.core.reader_shutdown.swap(None) {
            debug!(conn_id = self.core.state.id(), "Tearing down stream connection");
            shutdown.cancel();
        }
    }
}

impl<C: StreamConnector> Drop for StreamConnection<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
