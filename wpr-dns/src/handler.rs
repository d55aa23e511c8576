use std::{net::IpAddr, sync::Arc};

use hickory_proto::{
    op::{Header, Message, MessageType, OpCode, ResponseCode},
    rr::{
        rdata::{A, AAAA},
        RData, Record, RecordType,
    },
};
use tracing::{debug, warn};

use crate::{
    classify::{is_local_name, is_private},
    DnsOptions, HostResolver, RealDnsLookup,
};

/// Answers DNS queries: public names resolve to the proxy, private names optionally pass
/// through to the real nameserver.
#[derive(Debug)]
pub struct DnsHandler {
    options: DnsOptions,
    lookup: Arc<RealDnsLookup>,
}

impl DnsHandler {
    pub fn new(options: DnsOptions, lookup: Arc<RealDnsLookup>) -> Self {
        Self { options, lookup }
    }

    pub fn options(&self) -> &DnsOptions {
        &self.options
    }

    /// Handles one raw query. Returns the raw reply, or `None` if the datagram is dropped.
    pub async fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(query) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, len = query.len(), "dropping malformed DNS query");
                return None;
            }
        };

        if request.message_type() != MessageType::Query {
            debug!(id = request.id(), "dropping DNS message that is not a query");
            return None;
        }

        if request.op_code() != OpCode::Query {
            debug!(id = request.id(), op_code = ?request.op_code(), "unsupported DNS opcode");
            return encode(&error_reply(&request, ResponseCode::NotImp));
        }

        if let Some(name) = self.passthrough_name(&request).await {
            return match self.lookup.forward(query).await {
                Ok(reply) => {
                    debug!(%name, "passed private name through");
                    Some(reply)
                }
                Err(e) => {
                    warn!(%name, error = %e, "private DNS passthrough failed");
                    encode(&error_reply(&request, ResponseCode::ServFail))
                }
            };
        }

        encode(&proxy_answer(&request, self.options.proxy_ip, self.options.ttl))
    }

    /// Returns the queried name if the query must go to the real nameserver.
    async fn passthrough_name(&self, request: &Message) -> Option<String> {
        if !self.options.private_passthrough {
            return None;
        }

        let query = request.queries().first()?;
        let name = query.name().to_ascii().trim_end_matches('.').to_ascii_lowercase();

        if self.options.skip_hosts.contains(&name) {
            return None;
        }

        self.is_private_name(&name).await.then_some(name)
    }

    async fn is_private_name(&self, name: &str) -> bool {
        if is_local_name(name) {
            return true;
        }

        match self.lookup.resolve(name).await {
            Ok(ip) => is_private(ip),
            Err(e) => {
                debug!(name, error = %e, "real lookup failed, treating name as public");
                false
            }
        }
    }
}

/// Answers every question with the proxy address. Questions the proxy address cannot answer
/// (an `A` question for an IPv6 proxy, `MX`, ...) get no records and `NOERROR`.
pub(crate) fn proxy_answer(request: &Message, proxy: IpAddr, ttl: u32) -> Message {
    let mut reply = Message::new();
    reply.set_header(Header::response_from_request(request.header()));
    reply.set_recursion_available(true);

    for query in request.queries() {
        reply.add_query(query.clone());

        let rdata = match (query.query_type(), proxy) {
            (RecordType::A, IpAddr::V4(ip)) => RData::A(A(ip)),
            (RecordType::AAAA, IpAddr::V6(ip)) => RData::AAAA(AAAA(ip)),
            _ => continue,
        };

        reply.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
    }

    reply
}

fn error_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::error_msg(request.id(), request.op_code(), code);
    reply.add_queries(request.queries().to_vec());
    reply
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| warn!(error = %e, "failed to encode DNS reply"))
        .ok()
}
