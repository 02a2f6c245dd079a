/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS transport helpers for stream and socket oriented protocols.
//!
//! Converts between Hickory `Message` and wire bytes, and performs framed I/O
//! for stream-based transports (2-byte big-endian length prefix, shared by
//! TCP, DoT and DoQ).

use bytes::BytesMut;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{DnsError, Result};

pub mod quic_transport;
pub mod tcp_transport;
pub mod udp_transport;

/// Byte stream produced by a connect strategy (plain TCP, TLS, proxy tunnel)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> AsyncStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

/// Serialize a message, rejecting anything that cannot carry a length prefix
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let bytes = msg
        .to_bytes()
        .map_err(|e| DnsError::protocol(format!("Failed to serialize DNS message: {}", e)))?;
    if bytes.len() > u16::MAX as usize {
        return Err(DnsError::protocol(format!(
            "DNS message too large: {} bytes (max 65535)",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Prefix `body` with its 2-byte big-endian length
pub fn frame(body: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Read one length-prefixed message
pub async fn read_from_async_io<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_prefix = [0u8; 2];
    reader
        .read_exact(&mut len_prefix)
        .await
        .map_err(|e| DnsError::transport(format!("Failed to read length prefix: {}", e)))?;
    let msg_len = u16::from_be_bytes(len_prefix) as usize;

    let mut buf = vec![0u8; msg_len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| DnsError::transport(format!("Failed to read DNS message body: {}", e)))?;

    Message::from_bytes(&buf).map_err(|e| DnsError::protocol(format!("Invalid DNS message: {}", e)))
}

/// Write one length-prefixed message in a single write
pub async fn write_to_async_io<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    writer
        .write_all(&frame(&bytes))
        .await
        .map_err(|e| DnsError::transport(format!("Failed to write DNS frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| DnsError::transport(format!("Failed to flush DNS frame: {}", e)))
}
