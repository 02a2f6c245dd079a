/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::{DnsError, Result};
use crate::network::transport::{encode_message, frame};
use bytes::BytesMut;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};

/// Length-prefixed DNS framing over any byte stream (TCP, TLS, proxy tunnel)
pub struct TcpTransport<S> {
    stream: S,
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_split(self) -> (TcpTransportReader<S>, TcpTransportWriter<S>) {
        let (reader, writer) = split(self.stream);
        (
            TcpTransportReader {
                reader,
                buf: BytesMut::with_capacity(8192),
            },
            TcpTransportWriter { writer },
        )
    }
}

pub struct TcpTransportWriter<S> {
    writer: WriteHalf<S>,
}

impl<S> TcpTransportWriter<S>
where
    S: AsyncWrite,
{
    /// Write one message as a single frame and flush it
    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let bytes = encode_message(msg)?;
        self.writer
            .write_all(&frame(&bytes))
            .await
            .map_err(|e| DnsError::transport(format!("Failed to write DNS frame: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DnsError::transport(format!("Failed to flush DNS frame: {}", e)))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

pub struct TcpTransportReader<S> {
    reader: ReadHalf<S>,
    buf: BytesMut,
}

impl<S> TcpTransportReader<S>
where
    S: AsyncRead,
{
    /// Read the next decodable message
    ///
    /// Zero-length frames are skipped. An undecodable frame is a protocol
    /// error; EOF and I/O failures are transport errors.
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            // The buffer may already hold several frames
            if self.buf.len() >= 2 {
                let msg_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;

                if msg_len == 0 {
                    let _ = self.buf.split_to(2);
                    continue;
                }

                if self.buf.len() >= 2 + msg_len {
                    let frame = self.buf.split_to(2 + msg_len);
                    return Message::from_bytes(&frame[2..]).map_err(|e| {
                        DnsError::protocol(format!("Undecodable DNS frame of {msg_len} bytes: {e}"))
                    });
                }
            }

            self.buf.reserve(4096);
            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| DnsError::transport(format!("Stream read error: {}", e)))?;

            if n == 0 {
                return Err(DnsError::transport("Stream closed by peer (EOF)"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::serialize::binary::BinEncodable;

    fn message(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg
    }

    #[tokio::test]
    async fn reads_back_to_back_frames_and_rejects_garbage() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (mut reader, _writer) = TcpTransport::new(client).into_split();

        let mut wire = Vec::new();
        wire.extend_from_slice(&frame(&message(1).to_bytes().unwrap()));
        wire.extend_from_slice(&[0, 0]);
        wire.extend_from_slice(&frame(&[0xff, 0xff, 0xff]));
        wire.extend_from_slice(&frame(&message(2).to_bytes().unwrap()));
        server.write_all(&wire).await.unwrap();

        assert_eq!(reader.read_message().await.unwrap().id(), 1);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, DnsError::Protocol(_)), "unexpected {err:?}");
        // the bad frame is consumed whole, framing stays aligned
        assert_eq!(reader.read_message().await.unwrap().id(), 2);

        drop(server);
        let err = reader.read_message().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
