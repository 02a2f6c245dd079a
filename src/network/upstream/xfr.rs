/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Zone transfer (AXFR/IXFR) assembly
//!
//! A transfer answers one request with a sequence of messages sharing the
//! request's id. The stream ends with a message whose last answer is the
//! closing SOA.

use crate::network::upstream::message::Response;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTransferKind {
    Axfr,
    Ixfr,
}

/// Whether `message` closes the transfer
///
/// `first` tells whether this is the first message of the transfer, where a
/// lone SOA only opens the zone.
pub fn is_final_fragment(kind: ZoneTransferKind, message: &Message, first: bool) -> bool {
    let answers = message.answers();
    if answers.is_empty() || message.response_code() != ResponseCode::NoError {
        return true;
    }

    // an up-to-date IXFR is answered by the current SOA alone
    if kind == ZoneTransferKind::Ixfr && answers.len() == 1 && is_soa(answers) {
        return true;
    }

    is_soa(answers) && (answers.len() > 1 || !first)
}

fn is_soa(answers: &[hickory_proto::rr::Record]) -> bool {
    answers
        .last()
        .is_some_and(|r| r.record_type() == RecordType::SOA)
}

/// Collects transfer fragments until the closing one arrives
#[derive(Debug)]
pub struct ZoneTransferAssembler {
    kind: ZoneTransferKind,
    fragments: Vec<Message>,
    complete: bool,
}

impl ZoneTransferAssembler {
    pub fn new(kind: ZoneTransferKind) -> Self {
        Self {
            kind,
            fragments: Vec::new(),
            complete: false,
        }
    }

    pub fn kind(&self) -> ZoneTransferKind {
        self.kind
    }

    /// Append a fragment; returns `true` once the transfer is complete
    ///
    /// Fragments pushed after completion are ignored.
    pub fn push(&mut self, message: Message) -> bool {
        if self.complete {
            return true;
        }
        let first = self.fragments.is_empty();
        self.complete = is_final_fragment(self.kind, &message, first);
        self.fragments.push(message);
        self.complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// The assembled chain, in arrival order
    pub fn finish(self) -> Option<Response> {
        Response::from_fragments(self.fragments)
    }
}
