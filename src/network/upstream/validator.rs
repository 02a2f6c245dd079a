/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Response validation
//!
//! Every transport runs answers through [`validate`] before handing them to
//! the caller. Checks, in order:
//! 1. the questions match what went out on the wire (or the server answered
//!    with FORMERR / REFUSED and no matching question section),
//! 2. an echoed client-subnet option matches the one we sent,
//! 3. the transaction id matches; a mismatch after everything else passed
//!    is reported as [`DnsError::Spoofing`].

use crate::core::error::{DnsError, Result};
use crate::network::upstream::message::Request;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, RecordType};
use std::net::IpAddr;
use tracing::debug;

/// Check `response` against `request`
///
/// May strip an echoed client-subnet option from a referral.
pub fn validate(request: &Request, response: &mut Message) -> Result<()> {
    let asked = request.wire_queries();
    let answered = response.queries();

    if asked.len() == answered.len() {
        for (asked, answered) in asked.iter().zip(answered) {
            if !same_question(asked, answered) {
                return Err(DnsError::validation(format!(
                    "question mismatch: asked {} {} {}, answered {} {} {}",
                    asked.name(),
                    asked.query_class(),
                    asked.query_type(),
                    answered.name(),
                    answered.query_class(),
                    answered.query_type()
                )));
            }
        }
    } else if !matches!(
        response.response_code(),
        ResponseCode::FormErr | ResponseCode::Refused
    ) {
        return Err(DnsError::validation(format!(
            "question count mismatch: asked {}, answered {} with {}",
            asked.len(),
            answered.len(),
            response.response_code()
        )));
    }

    check_client_subnet(request.message(), response)?;

    if response.id() != request.id() {
        return Err(DnsError::Spoofing {
            expected: request.id(),
            actual: response.id(),
        });
    }
    Ok(())
}

fn same_question(asked: &Query, answered: &Query) -> bool {
    asked.query_type() == answered.query_type()
        && asked.query_class() == answered.query_class()
        && same_name(asked.name(), answered.name())
}

/// Case-insensitive comparison that ignores the root label
fn same_name(a: &Name, b: &Name) -> bool {
    let a = a.to_ascii();
    let b = b.to_ascii();
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

fn client_subnet(message: &Message) -> Option<ClientSubnet> {
    match message.extensions().as_ref()?.options().get(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => Some(subnet.clone()),
        _ => None,
    }
}

fn check_client_subnet(request: &Message, response: &mut Message) -> Result<()> {
    let Some(echoed) = client_subnet(response) else {
        return Ok(());
    };

    let consistent = client_subnet(request).is_some_and(|sent| same_subnet(&sent, &echoed));
    if consistent {
        return Ok(());
    }

    if is_referral(response) {
        debug!("Stripping client subnet option echoed in referral");
        if let Some(edns) = response.extensions_mut() {
            edns.options_mut().remove(EdnsCode::Subnet);
        }
        return Ok(());
    }

    Err(DnsError::validation(if client_subnet(request).is_some() {
        "client subnet echo does not match the request"
    } else {
        "response carries a client subnet option that was never sent"
    }))
}

/// Same family, source prefix and network address
fn same_subnet(sent: &ClientSubnet, echoed: &ClientSubnet) -> bool {
    sent.source_prefix() == echoed.source_prefix()
        && masked(sent.addr(), sent.source_prefix()) == masked(echoed.addr(), echoed.source_prefix())
}

fn masked(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - prefix.min(32) as u32).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - prefix.min(128) as u32).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// Delegation without answers from a server that is not authoritative
fn is_referral(response: &Message) -> bool {
    response.answers().is_empty()
        && !response.authoritative()
        && response
            .name_servers()
            .iter()
            .any(|r| r.record_type() == RecordType::NS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::upstream::test_support::{answer_for, ns_record, query_message};
    use hickory_proto::op::Edns;
    use std::str::FromStr;

    fn with_subnet(message: &mut Message, addr: &str, prefix: u8) {
        let mut edns = message.extensions().clone().unwrap_or_else(Edns::new);
        edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
            addr.parse().unwrap(),
            prefix,
            0,
        )));
        message.set_edns(edns);
    }

    #[test]
    fn accepts_matching_answer_with_different_case() {
        let request = Request::new(query_message(10, "Example.COM.", RecordType::A));
        let mut response = answer_for(&query_message(10, "example.com.", RecordType::A), Vec::new());
        assert!(validate(&request, &mut response).is_ok());
    }

    #[test]
    fn rejects_wrong_question() {
        let request = Request::new(query_message(10, "example.com.", RecordType::A));
        let mut response = answer_for(&query_message(10, "example.com.", RecordType::AAAA), Vec::new());
        assert!(matches!(
            validate(&request, &mut response),
            Err(DnsError::Validation(_))
        ));
    }

    #[test]
    fn minimized_question_is_the_expected_one() {
        let request = Request::new(query_message(3, "www.example.com.", RecordType::A))
            .with_minimized(Query::query(Name::from_str("com.").unwrap(), RecordType::NS));
        let mut response = answer_for(&query_message(3, "com.", RecordType::NS), Vec::new());
        assert!(validate(&request, &mut response).is_ok());
    }

    #[test]
    fn missing_question_tolerated_only_for_formerr_and_refused() {
        let request = Request::new(query_message(5, "example.com.", RecordType::A));
        let mut response = Message::new();
        response.set_id(5);

        response.set_response_code(ResponseCode::ServFail);
        assert!(validate(&request, &mut response).is_err());

        response.set_response_code(ResponseCode::FormErr);
        assert!(validate(&request, &mut response).is_ok());

        response.set_response_code(ResponseCode::Refused);
        assert!(validate(&request, &mut response).is_ok());
    }

    #[test]
    fn id_mismatch_is_spoofing() {
        let request = Request::new(query_message(1, "example.com.", RecordType::A));
        let mut response = answer_for(&query_message(2, "example.com.", RecordType::A), Vec::new());
        assert!(matches!(
            validate(&request, &mut response),
            Err(DnsError::Spoofing {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn subnet_echo_rules() {
        let mut asked = query_message(8, "example.com.", RecordType::A);
        with_subnet(&mut asked, "192.0.2.77", 24);
        let request = Request::new(asked);

        // echo truncated to the prefix is fine
        let mut response = answer_for(request.message(), Vec::new());
        with_subnet(&mut response, "192.0.2.0", 24);
        assert!(validate(&request, &mut response).is_ok());

        // different network is not
        let mut response = answer_for(request.message(), Vec::new());
        with_subnet(&mut response, "198.51.100.0", 24);
        assert!(validate(&request, &mut response).is_err());

        // absent echo is always fine
        let mut response = answer_for(request.message(), Vec::new());
        response.set_edns(Edns::new());
        assert!(validate(&request, &mut response).is_ok());
    }

    #[test]
    fn unsolicited_subnet_stripped_from_referral() {
        let request = Request::new(query_message(9, "www.example.com.", RecordType::A));

        let mut answer = answer_for(request.message(), Vec::new());
        with_subnet(&mut answer, "203.0.113.0", 24);
        assert!(validate(&request, &mut answer).is_err());

        let mut referral = answer_for(request.message(), Vec::new());
        referral.add_name_server(ns_record("example.com.", "ns1.example.net."));
        with_subnet(&mut referral, "203.0.113.0", 24);
        assert!(validate(&request, &mut referral).is_ok());
        assert!(client_subnet(&referral).is_none());
    }
}
