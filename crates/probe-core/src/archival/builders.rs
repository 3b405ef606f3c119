//! Record builders
//!
//! Builders never fail. Missing or malformed inputs still produce a
//! well-formed record with empty lists and default values.

use super::*;
use crate::failure::{new_failure, NetError};
use crate::netx::{HttpRequest, HttpResponse, TlsConfig, TlsConnectionState};
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;

/// Split `host:port`, logging and defaulting on malformed input
pub(crate) fn split_host_port(address: &str) -> (String, i64) {
    if let Ok(addr) = address.parse::<std::net::SocketAddr>() {
        return (addr.ip().to_string(), i64::from(addr.port()));
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map(i64::from).unwrap_or_else(|_| {
                warn!("BUG: split_host_port: invalid port in {address:?}");
                0
            });
            (host.trim_start_matches('[').trim_end_matches(']').to_string(), port)
        }
        None => {
            warn!("BUG: split_host_port: cannot split {address:?}");
            (address.to_string(), 0)
        }
    }
}

/// A lifecycle annotation such as `tls_handshake_start`
pub fn new_annotation_network_event(
    index: i64,
    time: Duration,
    operation: &str,
    tags: &[String],
) -> ArchivalNetworkEvent {
    ArchivalNetworkEvent {
        address: String::new(),
        failure: None,
        num_bytes: 0,
        operation: operation.to_string(),
        proto: String::new(),
        t0: time.as_secs_f64(),
        t: time.as_secs_f64(),
        transaction_id: index,
        tags: tags.to_vec(),
    }
}

/// An I/O event (`connect`, `read`, `write`, ...)
#[allow(clippy::too_many_arguments)]
pub fn new_network_event(
    index: i64,
    started: Duration,
    operation: &str,
    network: &str,
    address: &str,
    count: usize,
    err: Option<&NetError>,
    finished: Duration,
    tags: &[String],
) -> ArchivalNetworkEvent {
    ArchivalNetworkEvent {
        address: address.to_string(),
        failure: new_failure(err),
        num_bytes: i64::try_from(count).unwrap_or(i64::MAX),
        operation: operation.to_string(),
        proto: network.to_string(),
        t0: started.as_secs_f64(),
        t: finished.as_secs_f64(),
        transaction_id: index,
        tags: tags.to_vec(),
    }
}

/// Result of one TCP connect attempt
pub fn new_tcp_connect_result(
    index: i64,
    started: Duration,
    address: &str,
    err: Option<&NetError>,
    finished: Duration,
    tags: &[String],
) -> ArchivalTcpConnectResult {
    let (ip, port) = split_host_port(address);
    ArchivalTcpConnectResult {
        ip,
        port,
        status: ArchivalTcpConnectStatus {
            blocked: None,
            failure: new_failure(err),
            success: err.is_none(),
        },
        t0: started.as_secs_f64(),
        t: finished.as_secs_f64(),
        tags: tags.to_vec(),
        transaction_id: index,
    }
}

/// Result of one TLS or QUIC handshake
#[allow(clippy::too_many_arguments)]
pub fn new_tls_or_quic_handshake_result(
    index: i64,
    started: Duration,
    network: &str,
    address: &str,
    config: &TlsConfig,
    state: Option<&TlsConnectionState>,
    err: Option<&NetError>,
    finished: Duration,
    tags: &[String],
) -> ArchivalTlsOrQuicHandshakeResult {
    let state = state.cloned().unwrap_or_default();
    ArchivalTlsOrQuicHandshakeResult {
        network: network.to_string(),
        address: address.to_string(),
        cipher_suite: state.cipher_suite,
        failure: new_failure(err),
        so_error: None,
        negotiated_protocol: state.negotiated_protocol,
        no_tls_verify: config.insecure_skip_verify,
        peer_certificates: state.peer_certificates.into_iter().map(BinaryData).collect(),
        server_name: config.server_name.clone(),
        t0: started.as_secs_f64(),
        t: finished.as_secs_f64(),
        tags: tags.to_vec(),
        tls_version: state.tls_version,
        transaction_id: index,
    }
}

/// Result of one DNS lookup
#[allow(clippy::too_many_arguments)]
pub fn new_dns_lookup_result(
    index: i64,
    started: Duration,
    engine: &str,
    resolver_address: &str,
    query_type: &str,
    domain: &str,
    addrs: &[String],
    err: Option<&NetError>,
    finished: Duration,
    tags: &[String],
) -> ArchivalDnsLookupResult {
    ArchivalDnsLookupResult {
        answers: new_dns_answers(addrs),
        engine: engine.to_string(),
        failure: new_failure(err),
        getaddrinfo_error: 0,
        hostname: domain.to_string(),
        query_type: query_type.to_string(),
        raw_response: None,
        rcode: 0,
        resolver_hostname: None,
        resolver_port: None,
        resolver_address: resolver_address.to_string(),
        t0: started.as_secs_f64(),
        t: finished.as_secs_f64(),
        tags: tags.to_vec(),
        transaction_id: index,
    }
}

/// Classify resolved addresses into `A` and `AAAA` answers.
///
/// Resolvers never return invalid addresses, so one that does not parse
/// is logged as a bug and dropped.
pub fn new_dns_answers(addrs: &[String]) -> Vec<ArchivalDnsAnswer> {
    addrs
        .iter()
        .filter_map(|addr| match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Some(ArchivalDnsAnswer {
                answer_type: "A".to_string(),
                ipv4: addr.clone(),
                ..Default::default()
            }),
            Ok(IpAddr::V6(_)) => Some(ArchivalDnsAnswer {
                answer_type: "AAAA".to_string(),
                ipv6: addr.clone(),
                ..Default::default()
            }),
            Err(_) => {
                warn!("BUG: new_dns_answers: invalid IP address: {addr}");
                None
            }
        })
        .collect()
}

fn header_list(headers: &[(String, String)]) -> Vec<ArchivalHttpHeader> {
    let mut out: Vec<ArchivalHttpHeader> = headers
        .iter()
        .map(|(k, v)| (k.clone(), MaybeBinaryValue::from(v.as_str())))
        .collect();
    // stable sort keeps the order of repeated headers
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn header_map(headers: &[(String, String)]) -> BTreeMap<String, MaybeBinaryValue> {
    let mut out = BTreeMap::new();
    for (k, v) in headers {
        out.entry(k.clone())
            .or_insert_with(|| MaybeBinaryValue::from(v.as_str()));
    }
    out
}

/// Redirect target, resolved against the request URL. Only 3xx responses
/// redirect.
fn response_locations(req: Option<&HttpRequest>, resp: &HttpResponse) -> Vec<String> {
    if !(300..400).contains(&resp.status_code) {
        return Vec::new();
    }
    let Some(location) = resp.header("Location") else {
        return Vec::new();
    };
    let resolved = match req {
        Some(req) => req.url.join(location),
        None => url::Url::parse(location),
    };
    resolved.map(|u| vec![u.to_string()]).unwrap_or_default()
}

/// One HTTP transaction.
///
/// `max_body` is the snapshot limit used while reading `body`: a body
/// that reached it is flagged as truncated.
#[allow(clippy::too_many_arguments)]
pub fn new_http_request_result(
    index: i64,
    started: Duration,
    network: &str,
    address: &str,
    alpn: &str,
    transport: &str,
    req: Option<&HttpRequest>,
    resp: Option<&HttpResponse>,
    max_body: usize,
    err: Option<&NetError>,
    finished: Duration,
    tags: &[String],
) -> ArchivalHttpRequestResult {
    let request = match req {
        Some(req) => ArchivalHttpRequest {
            headers_list: header_list(&req.headers),
            headers: header_map(&req.headers),
            method: req.method.clone(),
            x_transport: transport.to_string(),
            url: req.url.to_string(),
            ..Default::default()
        },
        None => ArchivalHttpRequest {
            x_transport: transport.to_string(),
            ..Default::default()
        },
    };

    let response = match resp {
        Some(resp) => ArchivalHttpResponse {
            body: MaybeBinaryValue(resp.body.clone()),
            body_is_truncated: !resp.body.is_empty() && resp.body.len() >= max_body,
            code: i64::from(resp.status_code),
            headers_list: header_list(&resp.headers),
            headers: header_map(&resp.headers),
            locations: response_locations(req, resp),
        },
        None => ArchivalHttpResponse::default(),
    };

    ArchivalHttpRequestResult {
        network: network.to_string(),
        address: address.to_string(),
        alpn: alpn.to_string(),
        failure: new_failure(err),
        request,
        response,
        t0: started.as_secs_f64(),
        t: finished.as_secs_f64(),
        tags: tags.to_vec(),
        transaction_id: index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{Operation, CONNECTION_REFUSED};

    fn tags() -> Vec<String> {
        vec!["depth=0".to_string()]
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("8.8.8.8:53"), ("8.8.8.8".to_string(), 53));
        assert_eq!(split_host_port("[::1]:443"), ("::1".to_string(), 443));
        assert_eq!(split_host_port("example.com:80"), ("example.com".to_string(), 80));
        assert_eq!(split_host_port("garbage"), ("garbage".to_string(), 0));
        assert_eq!(split_host_port("host:port"), ("host".to_string(), 0));
    }

    #[test]
    fn test_tcp_connect_success() {
        let ev = new_tcp_connect_result(
            7,
            Duration::from_millis(100),
            "1.1.1.1:443",
            None,
            Duration::from_millis(250),
            &tags(),
        );
        assert_eq!(ev.ip, "1.1.1.1");
        assert_eq!(ev.port, 443);
        assert!(ev.status.success);
        assert_eq!(ev.status.failure, None);
        assert_eq!(ev.transaction_id, 7);
        assert!((ev.t0 - 0.1).abs() < f64::EPSILON);
        assert_eq!(ev.tags, tags());
    }

    #[test]
    fn test_tcp_connect_failure() {
        let err = NetError::new(Operation::Connect, CONNECTION_REFUSED);
        let ev = new_tcp_connect_result(1, Duration::ZERO, "1.1.1.1:80", Some(&err), Duration::ZERO, &[]);
        assert!(!ev.status.success);
        assert_eq!(ev.status.failure.as_deref(), Some("connection_refused"));
        assert!(ev.tags.is_empty());
    }

    #[test]
    fn test_dns_answers_classification() {
        let addrs = vec![
            "8.8.8.8".to_string(),
            "2001:4860:4860::8888".to_string(),
            "not-an-ip".to_string(),
        ];
        let answers = new_dns_answers(&addrs);
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].answer_type, "A");
        assert_eq!(answers[0].ipv4, "8.8.8.8");
        assert_eq!(answers[1].answer_type, "AAAA");
        assert_eq!(answers[1].ipv6, "2001:4860:4860::8888");
    }

    #[test]
    fn test_dns_lookup_defensive() {
        let ev = new_dns_lookup_result(0, Duration::ZERO, "", "", "", "", &[], None, Duration::ZERO, &[]);
        assert!(ev.answers.is_empty());
        assert!(ev.tags.is_empty());
        assert_eq!(ev.failure, None);
    }

    #[test]
    fn test_handshake_without_state() {
        let config = TlsConfig {
            server_name: "example.com".to_string(),
            insecure_skip_verify: true,
            ..Default::default()
        };
        let ev = new_tls_or_quic_handshake_result(
            3,
            Duration::ZERO,
            "tcp",
            "93.184.216.34:443",
            &config,
            None,
            None,
            Duration::ZERO,
            &[],
        );
        assert!(ev.peer_certificates.is_empty());
        assert!(ev.no_tls_verify);
        assert_eq!(ev.server_name, "example.com");
        assert_eq!(ev.tls_version, "");
    }

    #[test]
    fn test_http_result_with_redirect() {
        let req = HttpRequest::get(url::Url::parse("http://example.com/a/b").unwrap());
        let resp = HttpResponse {
            status_code: 302,
            headers: vec![
                ("Location".to_string(), "/c".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
            ],
            body: b"moved".to_vec(),
        };
        let ev = new_http_request_result(
            2,
            Duration::ZERO,
            "tcp",
            "93.184.216.34:80",
            "",
            "tcp",
            Some(&req),
            Some(&resp),
            1 << 19,
            None,
            Duration::from_secs(1),
            &[],
        );
        assert_eq!(ev.response.code, 302);
        assert_eq!(ev.response.locations, vec!["http://example.com/c".to_string()]);
        assert_eq!(ev.response.headers_list[0].0, "Content-Type");
        assert!(!ev.response.body_is_truncated);
        assert_eq!(ev.request.method, "GET");
        assert_eq!(ev.request.url, "http://example.com/a/b");
    }

    #[test]
    fn test_http_result_location_outside_redirect() {
        let req = HttpRequest::get(url::Url::parse("http://example.com/a").unwrap());
        let mut resp = HttpResponse {
            status_code: 201,
            headers: vec![("Location".to_string(), "/created/1".to_string())],
            body: Vec::new(),
        };
        let build = |resp: &HttpResponse| {
            new_http_request_result(
                1, Duration::ZERO, "tcp", "", "", "tcp", Some(&req), Some(resp), 16, None,
                Duration::ZERO, &[],
            )
        };
        assert!(build(&resp).response.locations.is_empty());

        resp.status_code = 301;
        assert_eq!(build(&resp).response.locations, vec!["http://example.com/created/1".to_string()]);
    }

    #[test]
    fn test_http_result_truncated_body() {
        let req = HttpRequest::get(url::Url::parse("http://example.com/").unwrap());
        let resp = HttpResponse {
            status_code: 200,
            headers: Vec::new(),
            body: vec![b'a'; 16],
        };
        let ev = new_http_request_result(
            1, Duration::ZERO, "tcp", "", "", "tcp", Some(&req), Some(&resp), 16, None,
            Duration::ZERO, &[],
        );
        assert!(ev.response.body_is_truncated);
    }

    #[test]
    fn test_http_result_without_response() {
        let err = NetError::new(Operation::HttpRoundTrip, CONNECTION_REFUSED);
        let ev = new_http_request_result(
            1, Duration::ZERO, "tcp", "", "", "tcp", None, None, 16, Some(&err),
            Duration::ZERO, &[],
        );
        assert_eq!(ev.response.code, 0);
        assert!(ev.response.headers_list.is_empty());
        assert_eq!(ev.failure.as_deref(), Some("connection_refused"));
    }
}
