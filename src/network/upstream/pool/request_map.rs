/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Request/response correlation for multiplexed streams
//!
//! Maps transaction ids to the channel of the waiting caller. Ids are unique
//! among in-flight requests on one stream: the caller's id is kept when free,
//! otherwise a free id is found by linear probing from a random start.
//! Zone transfer entries accumulate fragments until the closing one arrives.

use crate::core::error::{DnsError, Result};
use crate::network::upstream::message::Response;
use crate::network::upstream::xfr::{ZoneTransferAssembler, ZoneTransferKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hickory_proto::op::Message;
use rand::random;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

type Completion = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
struct PendingTransaction {
    /// Distinguishes reuses of the same id
    ticket: u64,
    completion: Completion,
    assembler: Option<ZoneTransferAssembler>,
}

/// In-flight transactions of one stream
#[derive(Debug, Default)]
pub(crate) struct RequestMap {
    pending: DashMap<u16, PendingTransaction>,
    tickets: AtomicU64,
}

impl RequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a transaction id, preferring `preferred`
    ///
    /// The entry is removed again when the returned guard drops.
    pub fn register(
        self: &Arc<Self>,
        preferred: u16,
        zone_transfer: Option<ZoneTransferKind>,
    ) -> Result<PendingGuard> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut transaction = Some(PendingTransaction {
            ticket,
            completion: tx,
            assembler: zone_transfer.map(ZoneTransferAssembler::new),
        });

        let start = random::<u16>();
        let candidates =
            std::iter::once(preferred).chain((0..=u16::MAX).map(|offset| start.wrapping_add(offset)));
        for id in candidates {
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(transaction) = transaction.take() {
                    slot.insert(transaction);
                }
                return Ok(PendingGuard {
                    map: self.clone(),
                    id,
                    ticket,
                    receiver: rx,
                });
            }
        }

        Err(DnsError::transport(
            "RequestMap exhausted: every transaction id is in flight",
        ))
    }

    /// Route an incoming message to its waiter
    ///
    /// Returns `false` when nobody waits for the message's id.
    pub fn dispatch(&self, message: Message) -> bool {
        let id = message.id();
        let Entry::Occupied(mut entry) = self.pending.entry(id) else {
            return false;
        };

        if let Some(assembler) = entry.get_mut().assembler.as_mut() {
            if !assembler.push(message) {
                return true;
            }
            let transaction = entry.remove();
            let result = transaction
                .assembler
                .and_then(ZoneTransferAssembler::finish)
                .ok_or_else(|| DnsError::protocol("empty zone transfer"));
            let _ = transaction.completion.send(result);
            return true;
        }

        let transaction = entry.remove();
        let _ = transaction.completion.send(Ok(Response::new(message)));
        true
    }

    /// Fail and remove every pending transaction
    pub fn fail_all(&self, cause: &DnsError) -> usize {
        let ids: Vec<u16> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, transaction)) = self.pending.remove(&id) {
                let _ = transaction.completion.send(Err(DnsError::Transport {
                    message: cause.to_string(),
                    reason: cause.stale_reason(),
                }));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, cause = %cause, "Failed pending transactions");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Registration of one in-flight transaction
#[derive(Debug)]
pub(crate) struct PendingGuard {
    map: Arc<RequestMap>,
    id: u16,
    ticket: u64,
    receiver: oneshot::Receiver<Result<Response>>,
}

impl PendingGuard {
    /// Transaction id to put on the wire
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Wait for the answer (or the stream's failure)
    pub async fn wait(&mut self) -> Result<Response> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::transport("connection closed before response")),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.map
            .pending
            .remove_if(&self.id, |_, transaction| transaction.ticket == ticket);
    }
}
