/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Message builders and loopback servers for unit tests

use crate::network::tls_config::ALPN_DOQ;
use crate::network::transport::{frame, read_from_async_io, write_to_async_io};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, NS, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use quinn::Endpoint;
use quinn::crypto::rustls::QuicServerConfig;
use rcgen::{CertificateParams, KeyPair};
use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;

pub fn query_message(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message
}

/// Response echoing the id and questions of `request`
pub fn answer_for(request: &Message, answers: Vec<Record>) -> Message {
    let mut message = Message::new();
    message
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    message.add_queries(request.queries().to_vec());
    message.add_answers(answers);
    message
}

pub fn a_record(name: &str, ip: [u8; 4]) -> Record {
    Record::from_rdata(
        Name::from_str(name).unwrap(),
        300,
        RData::A(A(Ipv4Addr::from(ip))),
    )
}

pub fn ns_record(zone: &str, host: &str) -> Record {
    Record::from_rdata(
        Name::from_str(zone).unwrap(),
        3600,
        RData::NS(NS(Name::from_str(host).unwrap())),
    )
}

pub fn soa_record(zone: &str, serial: u32) -> Record {
    let zone_name = Name::from_str(zone).unwrap();
    Record::from_rdata(
        zone_name.clone(),
        3600,
        RData::SOA(SOA::new(
            Name::from_str("ns1.").unwrap().append_domain(&zone_name).unwrap(),
            Name::from_str("hostmaster.").unwrap().append_domain(&zone_name).unwrap(),
            serial,
            7200,
            900,
            1_209_600,
            300,
        )),
    )
}

/// UDP server answering each query with whatever `handler` returns
///
/// Returns the bound address and a counter of received queries.
pub async fn spawn_udp_server<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(Message) -> Vec<Message> + Send + Sync + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_bytes(&buf[..len]) else {
                continue;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            for reply in handler(query) {
                let _ = socket.send_to(&reply.to_bytes().unwrap(), from).await;
            }
        }
    });
    (addr, received)
}

/// Loopback stream server and what it observed
pub struct StreamServer {
    pub addr: SocketAddr,
    /// Streams accepted (after the TLS handshake, if any)
    pub accepted: Arc<AtomicUsize>,
    /// Streams that ended because the client closed or broke them
    pub closed: Arc<AtomicUsize>,
}

/// TCP server speaking length-prefixed DNS
///
/// Every accepted stream answers queries in order. Returns the bound address
/// and a counter of accepted streams.
pub async fn spawn_tcp_server<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(Message) -> Vec<Message> + Send + Sync + 'static,
{
    let server = spawn_stream_server(handler, None).await;
    (server.addr, server.accepted)
}

/// Same as [`spawn_tcp_server`], wrapped in TLS with a self-signed certificate
pub async fn spawn_tls_server<F>(handler: F, alpn: &[u8]) -> StreamServer
where
    F: Fn(Message) -> Vec<Message> + Send + Sync + 'static,
{
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(alpn)));
    spawn_stream_server(handler, Some(acceptor)).await
}

pub async fn spawn_stream_server<F>(handler: F, tls: Option<TlsAcceptor>) -> StreamServer
where
    F: Fn(Message) -> Vec<Message> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let (accepted_counter, closed_counter) = (accepted.clone(), closed.clone());
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            let tls = tls.clone();
            let (accepted, closed) = (accepted_counter.clone(), closed_counter.clone());
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => {
                        let Ok(stream) = acceptor.accept(stream).await else {
                            return;
                        };
                        accepted.fetch_add(1, Ordering::SeqCst);
                        serve_stream(stream, handler.as_ref()).await;
                    }
                    None => {
                        accepted.fetch_add(1, Ordering::SeqCst);
                        serve_stream(stream, handler.as_ref()).await;
                    }
                }
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    StreamServer {
        addr,
        accepted,
        closed,
    }
}

async fn serve_stream<S, F>(mut stream: S, handler: &F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(Message) -> Vec<Message>,
{
    while let Ok(query) = read_from_async_io(&mut stream).await {
        for reply in handler(query) {
            if write_to_async_io(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }
}

/// Self-signed certificate for `localhost`
pub fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key_pair = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    (
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    )
}

/// TLS 1.3 server configuration offering one ALPN protocol
pub fn server_tls_config(alpn: &[u8]) -> ServerConfig {
    let (cert, key) = self_signed();
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    config.alpn_protocols = vec![alpn.to_vec()];
    config
}

/// QUIC endpoint on a loopback port, serving `alpn`
pub fn quic_server_endpoint(alpn: &[u8]) -> Endpoint {
    let crypto = QuicServerConfig::try_from(Arc::new(server_tls_config(alpn))).unwrap();
    Endpoint::server(
        quinn::ServerConfig::with_crypto(Arc::new(crypto)),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap()
}

/// DoQ server: one length-prefixed query per stream, every reply written
/// back on that stream before it is finished
///
/// Returns the bound address and a counter of QUIC handshakes.
pub fn spawn_quic_server<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(Message) -> Vec<Message> + Send + Sync + 'static,
{
    let endpoint = quic_server_endpoint(ALPN_DOQ);
    let addr = endpoint.local_addr().unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let handler = handler.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(connection) = incoming.await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                while let Ok((mut send, mut recv)) = connection.accept_bi().await {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let mut len_prefix = [0u8; 2];
                        if recv.read_exact(&mut len_prefix).await.is_err() {
                            return;
                        }
                        let mut body = vec![0u8; u16::from_be_bytes(len_prefix) as usize];
                        if recv.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        let Ok(query) = Message::from_bytes(&body) else {
                            return;
                        };
                        for reply in handler(query) {
                            let bytes = reply.to_bytes().unwrap();
                            if send.write_all(&frame(&bytes)).await.is_err() {
                                return;
                            }
                        }
                        let _ = send.finish();
                        let _ = send.stopped().await;
                    });
                }
            });
        }
    });
    (addr, handshakes)
}

/// Handler answering every query with one A record
pub fn echo_a(query: Message) -> Vec<Message> {
    let name = query.queries()[0].name().to_string();
    vec![answer_for(&query, vec![a_record(&name, [192, 0, 2, 1])])]
}
