/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::{DnsError, Result, StaleReason};
use crate::network::transport::encode_message;
use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use quinn::{Connection, ConnectionError, ReadError, ReadExactError, RecvStream, SendStream, WriteError};

/// Client side of a DoQ session: one bidirectional stream per query
pub struct QuicTransport {
    conn: Connection,
}

impl QuicTransport {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Open a bidirectional stream to the peer.
    pub async fn open_bi(&self) -> Result<(QuicTransportReader, QuicTransportWriter)> {
        match self.conn.open_bi().await {
            Ok((send, recv)) => Ok((QuicTransportReader { recv }, QuicTransportWriter { send })),
            Err(e) => Err(connection_error("Failed to open QUIC bidirectional stream", &e)),
        }
    }

    /// Whether the session is still usable
    pub fn is_open(&self) -> bool {
        self.conn.close_reason().is_none()
    }

    /// Close the underlying QUIC connection with application code 0.
    pub fn close(&self, reason: &[u8]) {
        self.conn.close(0u32.into(), reason);
    }
}

/// Writer wrapper over a QUIC SendStream that frames DNS messages
/// with 2-byte big-endian length prefix before writing.
pub struct QuicTransportWriter {
    send: SendStream,
}

impl QuicTransportWriter {
    /// Write a single DNS message as a length-prefixed frame and finish the
    /// send side.
    pub async fn write_final(&mut self, msg: &Message) -> Result<()> {
        let body = encode_message(msg)?;
        let len = (body.len() as u16).to_be_bytes();

        let mut chunks = [Bytes::copy_from_slice(&len), Bytes::from(body)];
        self.send
            .write_all_chunks(&mut chunks)
            .await
            .map_err(|e| write_error(&e))?;
        self.send
            .finish()
            .map_err(|e| DnsError::transport(format!("Failed to finish QUIC send stream: {}", e)))
    }
}

/// Reader wrapper over a QUIC RecvStream that reads framed DNS messages
pub struct QuicTransportReader {
    recv: RecvStream,
}

impl QuicTransportReader {
    pub async fn read_message(&mut self) -> Result<Message> {
        let mut len_prefix = [0u8; 2];
        self.recv
            .read_exact(&mut len_prefix)
            .await
            .map_err(|e| read_error("Failed to read QUIC length prefix", &e))?;
        let msg_len = u16::from_be_bytes(len_prefix) as usize;
        if msg_len == 0 {
            return Err(DnsError::protocol(
                "Invalid zero-length DNS message over QUIC",
            ));
        }

        let mut body = vec![0u8; msg_len];
        self.recv
            .read_exact(&mut body)
            .await
            .map_err(|e| read_error("Failed to read QUIC DNS body", &e))?;
        Message::from_bytes(&body)
            .map_err(|e| DnsError::protocol(format!("Invalid DNS message over QUIC: {}", e)))
    }
}

/// Map a connection-level failure to a staleness class
///
/// Idle expiry and local closure mean the cached session is dead but the
/// server may be fine; everything else counts as a plain transport error.
pub fn stale_reason(err: &ConnectionError) -> Option<StaleReason> {
    match err {
        ConnectionError::TimedOut | ConnectionError::LocallyClosed => {
            Some(StaleReason::ConnectionIdle)
        }
        _ => None,
    }
}

pub(crate) fn connection_error(context: &str, err: &ConnectionError) -> DnsError {
    DnsError::Transport {
        message: format!("{context}: {err}"),
        reason: stale_reason(err),
    }
}

fn write_error(err: &WriteError) -> DnsError {
    match err {
        WriteError::ConnectionLost(e) => connection_error("QUIC connection lost during write", e),
        other => DnsError::transport(format!("Failed to write QUIC DNS frame: {other}")),
    }
}

fn read_error(context: &str, err: &ReadExactError) -> DnsError {
    match err {
        ReadExactError::ReadError(ReadError::ConnectionLost(e)) => connection_error(context, e),
        other => DnsError::transport(format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_stale() {
        assert_eq!(
            stale_reason(&ConnectionError::TimedOut),
            Some(StaleReason::ConnectionIdle)
        );
        assert_eq!(stale_reason(&ConnectionError::Reset), None);

        let err = connection_error("open", &ConnectionError::TimedOut);
        assert_eq!(err.stale_reason(), Some(StaleReason::ConnectionIdle));
        assert!(err.is_retryable());
    }
}
