/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::config::StalePolicy;
use crate::core::error::{DnsError, Result};
use crate::network::transport::encode_message;
use crate::network::transport::udp_transport::UdpTransport;
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::pool::socket_pool::{DatagramSockets, PooledSocket};
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::query::{self, Attempt};
use crate::network::upstream::validator::validate;
use crate::network::upstream::{Connection, ConnectionState, ServerIdentity};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Plain DNS over UDP
///
/// Stateless apart from the shared socket pool: each `query` call holds one
/// socket for all of its attempts, so late answers to an earlier attempt
/// still count. Answers from the wrong source, undecodable datagrams and
/// answers failing validation are dropped while the attempt keeps waiting.
#[derive(Debug)]
pub struct DatagramConnection {
    state: ConnectionState,
    sockets: Arc<DatagramSockets>,
    stale_policy: StalePolicy,
}

/// Socket held for the duration of one `query` call
enum DatagramLease {
    Pooled(PooledSocket),
    Proxied(UdpSocket),
}

impl DatagramLease {
    fn socket(&self) -> &UdpSocket {
        match self {
            DatagramLease::Pooled(pooled) => pooled.socket(),
            DatagramLease::Proxied(socket) => socket,
        }
    }

    fn is_proxied(&self) -> bool {
        matches!(self, DatagramLease::Proxied(_))
    }
}

impl DatagramConnection {
    pub(crate) fn new(
        id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        sockets: Arc<DatagramSockets>,
        stale_policy: StalePolicy,
    ) -> Result<Self> {
        proxy.require_udp("DNS over UDP")?;
        Ok(Self {
            state: ConnectionState::new(id, server, proxy),
            sockets,
            stale_policy,
        })
    }

    async fn lease(&self) -> Result<DatagramLease> {
        let target = self.state.server().addr;
        match self.state.proxy().get() {
            Some(proxy) => {
                let socket = proxy.bind_datagram(target).await?;
                socket.set_nonblocking(true)?;
                Ok(DatagramLease::Proxied(UdpSocket::from_std(socket)?))
            }
            None => Ok(DatagramLease::Pooled(self.sockets.acquire(&target)?)),
        }
    }

    /// Send `bytes` once and wait for a datagram that answers `request`
    async fn exchange(
        &self,
        lease: &DatagramLease,
        bytes: &[u8],
        request: &Request,
        rejection: &Mutex<Option<DnsError>>,
        attempt: Attempt,
    ) -> Result<Response> {
        let transport = UdpTransport::new(lease.socket());
        let target = self.state.server().addr;
        transport.send_to(bytes, target).await?;

        debug!(
            conn_id = self.state.id(),
            attempt = attempt.number,
            server = %target,
            "Sent DNS query over UDP"
        );

        let mut buf = vec![0u8; request.max_udp_payload()];
        loop {
            let (len, from) = transport.recv_from(&mut buf).await?;
            if !lease.is_proxied() && from != target {
                debug!(conn_id = self.state.id(), from = %from, "Dropping datagram from unexpected source");
                continue;
            }

            let mut message = match Message::from_bytes(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    debug!(conn_id = self.state.id(), error = %e, "Dropping undecodable datagram");
                    continue;
                }
            };

            match validate(request, &mut message) {
                Ok(()) => return Ok(Response::new(message)),
                Err(e) => {
                    warn!(
                        conn_id = self.state.id(),
                        server = %target,
                        error = %e,
                        "Ignoring datagram that does not answer the query"
                    );
                    if let Ok(mut slot) = rejection.lock() {
                        *slot = Some(e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connection for DatagramConnection {
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

        let bytes = encode_message(&request.wire_message(request.id()))?;
        let limit = request.max_udp_payload();
        if bytes.len() > limit {
            return Err(DnsError::config(format!(
                "query of {} bytes exceeds the {} byte datagram limit",
                bytes.len(),
                limit
            )));
        }

        let lease = self.lease().await?;
        let rejection = Mutex::new(None);
        let (lease_ref, bytes_ref, rejection_ref) = (&lease, &bytes[..], &rejection);

        let outcome = query::run(
            self.state.server(),
            request,
            timeout,
            retries,
            cancel,
            &self.stale_policy,
            move |attempt| self.exchange(lease_ref, bytes_ref, request, rejection_ref, attempt),
        )
        .await;

        // a rejected datagram explains a silent timeout better than NoResponse
        match outcome {
            Err(DnsError::NoResponse { server, qname }) => {
                let rejected = rejection
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                Err(rejected.unwrap_or(DnsError::NoResponse { server, qname }))
            }
            other => other,
        }
    }

    /// Nothing to release: sockets go back to the pool after every call
    fn teardown(&self) {}
}
