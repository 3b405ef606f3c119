//! DNS over UDP
//!
//! Sends an `A` and an `AAAA` query in parallel to one server and merges
//! the answers. Messages are built and parsed with `hickory-proto`; this
//! module only owns the sockets and what they report to the trace.

use super::{Context, DnsError, Resolver};
use crate::archival::new_network_event;
use crate::failure::{classify_generic_error, new_net_error, NetError, Operation};
use crate::trace::Trace;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const MAX_REPLY_LEN: usize = 4096;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(4);

// ============ Codec ============

/// Build a recursive query for `domain` with a single question.
pub fn encode_query(id: u16, domain: &str, qtype: RecordType) -> io::Result<Vec<u8>> {
    let invalid = |e: hickory_proto::error::ProtoError| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid domain name {domain:?}: {e}"),
        )
    };
    let mut name = Name::from_ascii(domain).map_err(invalid)?;
    name.set_fqdn(true);

    let mut query = Message::new();
    query
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    query.to_vec().map_err(invalid)
}

/// Extract the addresses of type `qtype` from a reply to query `id`.
pub fn decode_reply(buf: &[u8], id: u16, qtype: RecordType) -> Result<Vec<IpAddr>, DnsError> {
    let reply = Message::from_vec(buf).map_err(|_| DnsError::Misbehaving)?;
    if reply.id() != id {
        return Err(DnsError::WrongQueryId);
    }
    if reply.message_type() != MessageType::Response {
        return Err(DnsError::Misbehaving);
    }
    match reply.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::ServFail => return Err(DnsError::ServFail),
        ResponseCode::NXDomain => return Err(DnsError::NoSuchHost),
        ResponseCode::Refused => return Err(DnsError::Refused),
        _ => return Err(DnsError::Misbehaving),
    }

    let addrs: Vec<IpAddr> = reply
        .answers()
        .iter()
        .filter(|record| record.record_type() == qtype)
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    if addrs.is_empty() {
        return Err(DnsError::NoAnswer);
    }
    Ok(addrs)
}

// ============ Resolver ============

/// Resolver querying one DNS server over UDP.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    address: String,
}

impl UdpResolver {
    /// Resolver for the `ip:port` server `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    fn record(
        &self,
        trace: Option<&Trace>,
        operation: Operation,
        started: Duration,
        count: usize,
        err: Option<&NetError>,
    ) {
        let Some(trace) = trace else {
            return;
        };
        trace.push_network_event(new_network_event(
            trace.index(),
            started,
            operation.as_str(),
            "udp",
            &self.address,
            count,
            err,
            trace.time_since_zero(),
            trace.tags(),
        ));
    }

    async fn query(
        &self,
        ctx: &Context,
        server: SocketAddr,
        domain: &str,
        qtype: RecordType,
        trace: Option<&Trace>,
    ) -> io::Result<Vec<IpAddr>> {
        let elapsed = || trace.map(Trace::time_since_zero).unwrap_or_default();
        let id: u16 = rand::random();
        let query = encode_query(id, domain, qtype)?;

        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let started = elapsed();
        match ctx.guard(socket.send(&query)).await {
            Ok(n) => self.record(trace, Operation::WriteTo, started, n, None),
            Err(e) => {
                let err = new_net_error(Operation::WriteTo, classify_generic_error, &e);
                self.record(trace, Operation::WriteTo, started, 0, Some(&err));
                return Err(e);
            }
        }

        let mut buf = vec![0u8; MAX_REPLY_LEN];
        let started = elapsed();
        let n = match ctx.guard(socket.recv(&mut buf)).await {
            Ok(n) => {
                self.record(trace, Operation::ReadFrom, started, n, None);
                if let Some(trace) = trace {
                    trace.update_read_summary("udp", &self.address, n);
                }
                n
            }
            Err(e) => {
                let err = new_net_error(Operation::ReadFrom, classify_generic_error, &e);
                self.record(trace, Operation::ReadFrom, started, 0, Some(&err));
                return Err(e);
            }
        };

        decode_reply(&buf[..n], id, qtype).map_err(DnsError::into_io)
    }
}

fn is_no_answer(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<DnsError>())
        .is_some_and(|dns| *dns == DnsError::NoAnswer)
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn lookup_host(
        &self,
        ctx: &Context,
        domain: &str,
        trace: Option<&Trace>,
    ) -> io::Result<Vec<String>> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip.to_string()]);
        }
        let server: SocketAddr = self.address.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid DNS server endpoint: {}", self.address),
            )
        })?;
        let ctx = if ctx.deadline().is_some() {
            ctx.child()
        } else {
            ctx.with_timeout(DEFAULT_QUERY_TIMEOUT)
        };

        debug!(
            "[#{}] DNSLookup {domain} via udp://{}",
            trace.map_or(0, Trace::index),
            self.address
        );
        let (a, aaaa) = tokio::join!(
            self.query(&ctx, server, domain, RecordType::A, trace),
            self.query(&ctx, server, domain, RecordType::AAAA, trace),
        );

        let mut addrs = Vec::new();
        for reply in [a, aaaa] {
            match reply {
                Ok(found) => addrs.extend(found.into_iter().map(|ip| ip.to_string())),
                Err(e) if is_no_answer(&e) => {}
                Err(e) => return Err(e),
            }
        }
        if addrs.is_empty() {
            return Err(DnsError::NoAnswer.into_io());
        }
        Ok(addrs)
    }

    fn network(&self) -> &str {
        "udp"
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{classify_resolver_error, DNS_NXDOMAIN_ERROR};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::Record;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::time::Instant;

    fn name(domain: &str) -> Name {
        Name::from_ascii(domain).unwrap()
    }

    /// The reply a server would send to `query`
    fn answer(query: &Message, rcode: ResponseCode, answers: Vec<RData>) -> Vec<u8> {
        let mut reply = Message::new();
        reply
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .set_response_code(rcode)
            .add_queries(query.queries().to_vec());
        for rdata in answers {
            reply.add_answer(Record::from_rdata(name("dns.google."), 300, rdata));
        }
        reply.to_vec().unwrap()
    }

    fn reply(id: u16, rcode: ResponseCode, answers: Vec<RData>) -> Vec<u8> {
        let query = Message::from_vec(&encode_query(id, "dns.google", RecordType::A).unwrap()).unwrap();
        answer(&query, rcode, answers)
    }

    // ============ Codec Tests ============

    #[test]
    fn test_encode_query() {
        let query = Message::from_vec(&encode_query(0xBEEF, "dns.google.", RecordType::AAAA).unwrap()).unwrap();
        assert_eq!(query.id(), 0xBEEF);
        assert_eq!(query.message_type(), MessageType::Query);
        assert!(query.recursion_desired());
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(query.queries()[0].name(), &name("dns.google."));
    }

    #[test]
    fn test_encode_rejects_bad_labels() {
        let err = encode_query(1, &"x".repeat(64), RecordType::A).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_decode_a_records() {
        let buf = reply(
            7,
            ResponseCode::NoError,
            vec![RData::A(A(Ipv4Addr::new(8, 8, 8, 8))), RData::A(A(Ipv4Addr::new(8, 8, 4, 4)))],
        );
        let addrs = decode_reply(&buf, 7, RecordType::A).unwrap();
        assert_eq!(addrs, vec![IpAddr::from([8, 8, 8, 8]), IpAddr::from([8, 8, 4, 4])]);
    }

    #[test]
    fn test_decode_skips_other_types() {
        let buf = reply(
            7,
            ResponseCode::NoError,
            vec![
                RData::CNAME(CNAME(name("foo."))),
                RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
                RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
            ],
        );
        assert_eq!(decode_reply(&buf, 7, RecordType::A).unwrap().len(), 1);
        assert_eq!(
            decode_reply(&buf, 7, RecordType::AAAA).unwrap(),
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]
        );
    }

    #[test]
    fn test_decode_rcodes() {
        let decode = |rcode| decode_reply(&reply(1, rcode, Vec::new()), 1, RecordType::A);
        assert_eq!(decode(ResponseCode::NXDomain), Err(DnsError::NoSuchHost));
        assert_eq!(decode(ResponseCode::ServFail), Err(DnsError::ServFail));
        assert_eq!(decode(ResponseCode::Refused), Err(DnsError::Refused));
        assert_eq!(decode(ResponseCode::NotImp), Err(DnsError::Misbehaving));
        assert_eq!(decode(ResponseCode::NoError), Err(DnsError::NoAnswer));
    }

    #[test]
    fn test_decode_wrong_id_and_garbage() {
        let buf = reply(1, ResponseCode::NoError, Vec::new());
        assert_eq!(decode_reply(&buf, 2, RecordType::A), Err(DnsError::WrongQueryId));
        assert_eq!(decode_reply(&[0; 5], 0, RecordType::A), Err(DnsError::Misbehaving));

        let mut truncated = reply(1, ResponseCode::NoError, vec![RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))]);
        truncated.truncate(truncated.len() - 2);
        assert_eq!(decode_reply(&truncated, 1, RecordType::A), Err(DnsError::Misbehaving));

        // a query echoed back is not a reply
        let query = encode_query(3, "dns.google", RecordType::A).unwrap();
        assert_eq!(decode_reply(&query, 3, RecordType::A), Err(DnsError::Misbehaving));
    }

    // ============ Resolver Tests ============

    async fn fake_server(rcode: ResponseCode) -> (String, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in 0..2 {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                let query = Message::from_vec(&buf[..n]).unwrap();
                let answers = if rcode == ResponseCode::NoError && query.queries()[0].query_type() == RecordType::A {
                    vec![RData::A(A(Ipv4Addr::new(8, 8, 8, 8)))]
                } else {
                    Vec::new()
                };
                socket.send_to(&answer(&query, rcode, answers), peer).await.unwrap();
            }
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_lookup_merges_and_records() {
        let (address, server) = fake_server(ResponseCode::NoError).await;
        let trace = Arc::new(Trace::new(4, Instant::now(), Vec::new()));
        let resolver = UdpResolver::new(address.clone());

        let addrs = resolver
            .lookup_host(&Context::new(), "dns.google", Some(&*trace))
            .await
            .unwrap();
        assert_eq!(addrs, vec!["8.8.8.8".to_string()]);
        server.await.unwrap();

        let events = trace.drain_network_events();
        assert_eq!(events.iter().filter(|e| e.operation == "write_to").count(), 2);
        assert_eq!(events.iter().filter(|e| e.operation == "read_from").count(), 2);
        assert!(events.iter().all(|e| e.proto == "udp" && e.address == address));
        assert_eq!(trace.sample_read_summary().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_nxdomain() {
        let (address, server) = fake_server(ResponseCode::NXDomain).await;
        let resolver = UdpResolver::new(address);
        let err = resolver
            .lookup_host(&Context::new(), "dns.google", None)
            .await
            .unwrap_err();
        assert_eq!(classify_resolver_error(&err), DNS_NXDOMAIN_ERROR);
        server.abort();
    }
}
