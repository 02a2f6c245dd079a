/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::network::upstream::xfr::ZoneTransferKind;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Record, RecordType};

/// Payload size assumed when the request carries no EDNS record
pub const MIN_UDP_PAYLOAD: usize = 512;

/// Upper bound for the datagram receive buffer
pub const MAX_UDP_PAYLOAD: usize = 4096;

/// Outgoing query handed to [`super::Connection::query`]
///
/// When `minimized` is set, the first question goes out in its minimized
/// form and answers are checked against that form instead of the full one.
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
    minimized: Option<Query>,
}

impl Request {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            minimized: None,
        }
    }

    pub fn with_minimized(mut self, query: Query) -> Self {
        self.minimized = Some(query);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn minimized(&self) -> Option<&Query> {
        self.minimized.as_ref()
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }

    /// Questions as they go out on the wire
    pub fn wire_queries(&self) -> Vec<Query> {
        let mut queries = self.message.queries().to_vec();
        if let (Some(minimized), Some(first)) = (&self.minimized, queries.first_mut()) {
            *first = minimized.clone();
        }
        queries
    }

    /// Copy of the message ready to send under transaction id `id`
    pub fn wire_message(&self, id: u16) -> Message {
        let mut message = self.message.clone();
        message.set_id(id);
        if self.minimized.is_some() {
            let queries = self.wire_queries();
            message.take_queries();
            message.add_queries(queries);
        }
        message
    }

    /// Zone transfer flavour, if the first question asks for one
    pub fn zone_transfer(&self) -> Option<ZoneTransferKind> {
        match self.message.queries().first()?.query_type() {
            RecordType::AXFR => Some(ZoneTransferKind::Axfr),
            RecordType::IXFR => Some(ZoneTransferKind::Ixfr),
            _ => None,
        }
    }

    /// Name of the (wire) question, for error messages
    pub fn qname(&self) -> Option<String> {
        self.minimized
            .as_ref()
            .or_else(|| self.message.queries().first())
            .map(|q| q.name().to_string())
    }

    /// Largest datagram this request may send or receive
    ///
    /// 512 without EDNS; otherwise the advertised payload, clamped to
    /// `[512, 4096]`.
    pub fn max_udp_payload(&self) -> usize {
        match self.message.extensions() {
            Some(edns) => (edns.max_payload() as usize).clamp(MIN_UDP_PAYLOAD, MAX_UDP_PAYLOAD),
            None => MIN_UDP_PAYLOAD,
        }
    }
}

impl From<Message> for Request {
    fn from(message: Message) -> Self {
        Request::new(message)
    }
}

/// Answer to a [`Request`]
///
/// Zone transfers arrive as several messages; they are kept in arrival
/// order as a chain hanging off the first one.
#[derive(Debug, Clone)]
pub struct Response {
    message: Message,
    next: Option<Box<Response>>,
}

impl Response {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            next: None,
        }
    }

    /// Chain `messages` in order; `None` when empty
    pub(crate) fn from_fragments(messages: Vec<Message>) -> Option<Self> {
        messages.into_iter().rev().fold(None, |next, message| {
            Some(Response {
                message,
                next: next.map(Box::new),
            })
        })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn next(&self) -> Option<&Response> {
        self.next.as_deref()
    }

    /// Every message of the chain, head first
    pub fn fragments(&self) -> impl Iterator<Item = &Message> {
        std::iter::successors(Some(self), |r| r.next()).map(|r| &r.message)
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments().count()
    }

    /// Answer records across all fragments
    pub fn answers(&self) -> impl Iterator<Item = &Record> {
        self.fragments().flat_map(|m| m.answers().iter())
    }

    /// Overwrite the transaction id of every fragment
    pub(crate) fn set_id(&mut self, id: u16) {
        let mut cursor = Some(self);
        while let Some(response) = cursor {
            response.message.set_id(id);
            cursor = response.next.as_deref_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Edns;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn query(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(7);
        message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message
    }

    #[test]
    fn payload_defaults_and_clamps() {
        let mut message = query("example.com.", RecordType::A);
        assert_eq!(Request::new(message.clone()).max_udp_payload(), 512);

        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        message.set_edns(edns.clone());
        assert_eq!(Request::new(message.clone()).max_udp_payload(), 1232);

        edns.set_max_payload(65000);
        message.set_edns(edns);
        assert_eq!(Request::new(message).max_udp_payload(), 4096);
    }

    #[test]
    fn minimized_question_replaces_first_on_wire() {
        let full = query("www.example.com.", RecordType::A);
        let request = Request::new(full).with_minimized(Query::query(
            Name::from_str("com.").unwrap(),
            RecordType::NS,
        ));

        let wire = request.wire_message(99);
        assert_eq!(wire.id(), 99);
        assert_eq!(wire.queries().len(), 1);
        assert_eq!(wire.queries()[0].query_type(), RecordType::NS);
        assert_eq!(request.qname().as_deref(), Some("com."));
        // the original stays intact
        assert_eq!(request.message().queries()[0].query_type(), RecordType::A);
    }

    #[test]
    fn zone_transfer_kind_from_question() {
        assert_eq!(
            Request::new(query("example.com.", RecordType::AXFR)).zone_transfer(),
            Some(ZoneTransferKind::Axfr)
        );
        assert_eq!(
            Request::new(query("example.com.", RecordType::IXFR)).zone_transfer(),
            Some(ZoneTransferKind::Ixfr)
        );
        assert_eq!(
            Request::new(query("example.com.", RecordType::A)).zone_transfer(),
            None
        );
    }

    #[test]
    fn chained_fragments_keep_order_and_share_id() {
        let mut response = Response::from_fragments(vec![
            query("a.", RecordType::A),
            query("b.", RecordType::A),
            query("c.", RecordType::A),
        ])
        .unwrap();
        assert_eq!(response.fragment_count(), 3);

        response.set_id(1234);
        let names: Vec<String> = response
            .fragments()
            .map(|m| m.queries()[0].name().to_string())
            .collect();
        assert_eq!(names, ["a.", "b.", "c."]);
        assert!(response.fragments().all(|m| m.id() == 1234));

        assert!(Response::from_fragments(Vec::new()).is_none());
    }
}
