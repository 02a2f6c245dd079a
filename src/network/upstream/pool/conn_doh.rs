/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over HTTPS
//!
//! - [`HttpsConnection`]: RFC 8484 wire format, POST with
//!   `application/dns-message`. The transaction id is zero on the wire and
//!   restored on the answer.
//! - [`JsonConnection`]: the JSON API served by Google and Cloudflare, GET
//!   with `name`/`type` parameters and `application/dns-json`.

use crate::config::TransportOptions;
use crate::core::error::{DnsError, Result};
use crate::network::transport::encode_message;
use crate::network::upstream::message::{Request, Response};
use crate::network::upstream::pool::conn_http::HttpClient;
use crate::network::upstream::proxy::ProxyRef;
use crate::network::upstream::query;
use crate::network::upstream::{Connection, ConnectionState, ServerIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderValue, Method};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DNS_MESSAGE: HeaderValue = HeaderValue::from_static("application/dns-message");
const DNS_JSON: HeaderValue = HeaderValue::from_static("application/dns-json");

/// DoH with RFC 8484 wire format bodies
#[derive(Debug)]
pub struct HttpsConnection {
    state: ConnectionState,
    client: HttpClient,
    options: Arc<TransportOptions>,
}

impl HttpsConnection {
    pub fn new(
        id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        options: Arc<TransportOptions>,
    ) -> Self {
        Self {
            client: HttpClient::new(id, server.clone(), proxy.clone(), options.clone()),
            state: ConnectionState::new(id, server, proxy),
            options,
        }
    }

    /// HTTP sessions established so far
    pub fn session_count(&self) -> u64 {
        self.client.session_count()
    }

    async fn attempt(&self, request: &Request) -> Result<Response> {
        let body = encode_message(&request.wire_message(0))?;
        let http_request = http::Request::builder()
            .method(Method::POST)
            .uri(self.client.endpoint()?.as_str())
            .version(self.client.version())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(())
            .map_err(|e| DnsError::config(format!("Invalid DoH request: {e}")))?;

        let reply = self.client.send(http_request, Some(Bytes::from(body))).await?;
        let body = reply.into_success()?;
        let mut message = Message::from_bytes(&body)
            .map_err(|e| DnsError::protocol(format!("Invalid DNS message in DoH body: {}", e)))?;
        message.set_id(request.id());
        Ok(Response::new(message))
    }
}

#[async_trait]
impl Connection for HttpsConnection {
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
        query::run(
            self.state.server(),
            request,
            timeout,
            retries,
            cancel,
            &self.options.stale_policy,
            move |_| self.attempt(request),
        )
        .await
    }

    fn teardown(&self) {
        self.client.teardown();
    }
}

/// DoH through the JSON API
///
/// Only the first question is sent. The answer is rebuilt as a DNS message
/// carrying the request's id; records of unsupported types are skipped.
#[derive(Debug)]
pub struct JsonConnection {
    state: ConnectionState,
    client: HttpClient,
    options: Arc<TransportOptions>,
}

impl JsonConnection {
    pub fn new(
        id: u16,
        server: ServerIdentity,
        proxy: ProxyRef,
        options: Arc<TransportOptions>,
    ) -> Self {
        Self {
            client: HttpClient::new(id, server.clone(), proxy.clone(), options.clone()),
            state: ConnectionState::new(id, server, proxy),
            options,
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Response> {
        let question = request
            .wire_queries()
            .into_iter()
            .next()
            .ok_or_else(|| DnsError::config("JSON DoH needs a question"))?;

        let mut url = self.client.endpoint()?.clone();
        {
            let mut params = url.query_pairs_mut();
            params
                .append_pair("name", &question.name().to_ascii())
                .append_pair("type", &question.query_type().to_string());
            if request.message().checking_disabled() {
                params.append_pair("cd", "1");
            }
        }

        let http_request = http::Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .version(self.client.version())
            .header(ACCEPT, DNS_JSON)
            .body(())
            .map_err(|e| DnsError::config(format!("Invalid JSON DoH request: {e}")))?;

        let reply = self.client.send(http_request, None).await?;
        let body = reply.into_success()?;
        let json: JsonResponse = serde_json::from_slice(&body)?;
        Ok(Response::new(json.into_message(request.id(), &question)))
    }
}

#[async_trait]
impl Connection for JsonConnection {
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
        query::run(
            self.state.server(),
            request,
            timeout,
            retries,
            cancel,
            &self.options.stale_policy,
            move |_| self.attempt(request),
        )
        .await
    }

    fn teardown(&self) {
        self.client.teardown();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonResponse {
    status: u16,
    #[serde(rename = "TC", default)]
    tc: bool,
    #[serde(rename = "RD", default)]
    rd: bool,
    #[serde(rename = "RA", default)]
    ra: bool,
    #[serde(rename = "AD", default)]
    ad: bool,
    #[serde(rename = "CD", default)]
    cd: bool,
    #[serde(default)]
    question: Vec<JsonQuestion>,
    #[serde(default)]
    answer: Vec<JsonRecord>,
    #[serde(default)]
    authority: Vec<JsonRecord>,
}

#[derive(Debug, Deserialize)]
struct JsonQuestion {
    name: String,
    #[serde(rename = "type")]
    qtype: u16,
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

impl JsonResponse {
    fn into_message(self, id: u16, asked: &Query) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(<ResponseCode as From<u16>>::from(self.status))
            .set_truncated(self.tc)
            .set_recursion_desired(self.rd)
            .set_recursion_available(self.ra)
            .set_authentic_data(self.ad)
            .set_checking_disabled(self.cd);

        let questions: Vec<Query> = self
            .question
            .iter()
            .filter_map(|q| {
                Some(Query::query(
                    Name::from_ascii(&q.name).ok()?,
                    RecordType::from(q.qtype),
                ))
            })
            .collect();
        if questions.is_empty() {
            message.add_query(asked.clone());
        } else {
            message.add_queries(questions);
        }

        message.add_answers(self.answer.iter().filter_map(json_record));
        message.add_name_servers(self.authority.iter().filter_map(json_record));
        message
    }
}

fn json_record(record: &JsonRecord) -> Option<Record> {
    let name = Name::from_ascii(&record.name).ok()?;
    let rtype = RecordType::from(record.rtype);
    let data = record.data.trim();
    let rdata = match rtype {
        RecordType::A => RData::A(A(data.parse().ok()?)),
        RecordType::AAAA => RData::AAAA(AAAA(data.parse().ok()?)),
        RecordType::CNAME => RData::CNAME(CNAME(Name::from_ascii(data).ok()?)),
        RecordType::NS => RData::NS(NS(Name::from_ascii(data).ok()?)),
        RecordType::PTR => RData::PTR(PTR(Name::from_ascii(data).ok()?)),
        RecordType::MX => {
            let (preference, exchange) = data.split_once(char::is_whitespace)?;
            RData::MX(MX::new(
                preference.parse().ok()?,
                Name::from_ascii(exchange.trim()).ok()?,
            ))
        }
        RecordType::TXT => RData::TXT(TXT::new(txt_strings(data))),
        RecordType::SOA => {
            let fields: Vec<&str> = data.split_whitespace().collect();
            let [mname, rname, serial, refresh, retry, expire, minimum] = fields[..] else {
                return None;
            };
            RData::SOA(SOA::new(
                Name::from_str(mname).ok()?,
                Name::from_str(rname).ok()?,
                serial.parse().ok()?,
                refresh.parse().ok()?,
                retry.parse().ok()?,
                expire.parse().ok()?,
                minimum.parse().ok()?,
            ))
        }
        _ => {
            debug!(name = %record.name, rtype = %rtype, "Skipping unsupported JSON record type");
            return None;
        }
    };
    Some(Record::from_rdata(name, record.ttl, rdata))
}

/// Character strings of a presentation-format TXT value
///
/// `"a" "b"` yields two strings, `\"` escapes a quote. Unquoted data is
/// taken whole.
fn txt_strings(data: &str) -> Vec<String> {
    if !data.starts_with('"') {
        return vec![data.to_string()];
    }
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        match current.as_mut() {
            None if c == '"' => current = Some(String::new()),
            None => {}
            Some(s) => match c {
                '\\' => s.extend(chars.next()),
                '"' => {
                    strings.push(std::mem::take(s));
                    current = None;
                }
                c => s.push(c),
            },
        }
    }
    // unterminated last segment
    strings.extend(current);
    strings
}
