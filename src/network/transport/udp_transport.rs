/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::core::error::{DnsError, Result};

/// Datagram I/O on an unconnected socket.
///
/// Requests are pre-encoded once per call and resent verbatim on every
/// attempt, so this works on raw bytes rather than messages.
#[derive(Debug)]
pub struct UdpTransport<'a> {
    socket: &'a UdpSocket,
}

impl<'a> UdpTransport<'a> {
    pub fn new(socket: &'a UdpSocket) -> Self {
        Self { socket }
    }

    /// Send one datagram, treating a short send as a transport failure
    pub async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        let n = self.socket.send_to(bytes, to).await?;
        if n != bytes.len() {
            return Err(DnsError::transport(format!(
                "Partial UDP send_to: sent {} of {} bytes",
                n,
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram into `buf`
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}
