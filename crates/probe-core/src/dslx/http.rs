//! HTTP transport and request steps

use super::fxcore::{operation, Maybe, Step, StepFunc};
use super::observations::{maybe_trace_to_observations, Observations};
use super::runtime::Runtime;
use super::tcp::TcpConnection;
use super::tls::TlsConnection;
use crate::archival::{new_annotation_network_event, new_http_request_result, split_host_port};
use crate::failure::{classify_generic_error, new_net_error, NetError, Operation, HTTP_UNSUPPORTED_PROTOCOL};
use crate::netx::{Context, Http1Transport, HttpRequest, HttpResponse, HttpTransport};
use crate::speed::SpeedCollector;
use crate::trace::Trace;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default `Accept` header
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Default `Accept-Language` header
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Default `User-Agent` header
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A connection ready to carry HTTP requests.
#[derive(Clone)]
pub struct HttpConnection {
    /// Remote `ip:port`
    pub address: String,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// `tcp` or `udp`
    pub network: String,
    /// `http` or `https`
    pub scheme: String,
    /// ALPN negotiated by TLS, empty for cleartext
    pub tls_negotiated_protocol: String,
    /// Trace inherited from the connection
    pub trace: Arc<Trace>,
    /// Sends requests over the connection
    pub transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("address", &self.address)
            .field("domain", &self.domain)
            .field("network", &self.network)
            .field("scheme", &self.scheme)
            .field("tls_negotiated_protocol", &self.tls_negotiated_protocol)
            .field("trace", &self.trace.index())
            .finish_non_exhaustive()
    }
}

/// [`Step`] behind [`http_transport_tcp`]
#[derive(Debug)]
pub struct HttpTransportTcp;

/// Cleartext HTTP/1.1 over a TCP connection
pub fn http_transport_tcp(_rt: &Arc<Runtime>) -> StepFunc<HttpTransportTcp> {
    operation(HttpTransportTcp)
}

#[async_trait]
impl Step<TcpConnection, HttpConnection> for HttpTransportTcp {
    async fn run(&self, _ctx: &Context, input: TcpConnection) -> Maybe<HttpConnection> {
        Maybe::ok(HttpConnection {
            transport: Arc::new(Http1Transport::new(input.conn)),
            address: input.address,
            domain: input.domain,
            network: input.network,
            scheme: "http".to_string(),
            tls_negotiated_protocol: String::new(),
            trace: input.trace,
        })
    }
}

/// [`Step`] behind [`http_transport_tls`]
#[derive(Debug)]
pub struct HttpTransportTls;

/// HTTPS over a TLS connection. Fails when the server picked `h2`, which
/// has no transport yet.
pub fn http_transport_tls(_rt: &Arc<Runtime>) -> StepFunc<HttpTransportTls> {
    operation(HttpTransportTls)
}

#[async_trait]
impl Step<TlsConnection, HttpConnection> for HttpTransportTls {
    async fn run(&self, _ctx: &Context, input: TlsConnection) -> Maybe<HttpConnection> {
        let alpn = input.state.negotiated_protocol;
        if alpn == "h2" {
            debug!("[#{}] HTTPTransport: {alpn} is not supported", input.trace.index());
            return Maybe::err(NetError::new(Operation::HttpRoundTrip, HTTP_UNSUPPORTED_PROTOCOL));
        }
        Maybe::ok(HttpConnection {
            transport: Arc::new(Http1Transport::new(input.conn)),
            address: input.address,
            domain: input.domain,
            network: input.network,
            scheme: "https".to_string(),
            tls_negotiated_protocol: alpn,
            trace: input.trace,
        })
    }
}

/// Request settings. Unset headers get browser-like defaults.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestOptions {
    /// `Accept` header
    pub accept: Option<String>,
    /// `Accept-Language` header
    pub accept_language: Option<String>,
    /// `Host` header; defaults to the URL host
    pub host: Option<String>,
    /// Method; defaults to `GET`
    pub method: Option<String>,
    /// `Referer` header, omitted when unset
    pub referer: Option<String>,
    /// Path and query; defaults to `/`
    pub url_path: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
}

/// A completed HTTP transaction.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    /// Remote `ip:port`
    pub address: String,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// `tcp` or `udp`
    pub network: String,
    /// What was sent
    pub request: HttpRequest,
    /// What came back, body snapshot included
    pub response: HttpResponse,
    /// Trace inherited from the connection
    pub trace: Arc<Trace>,
}

/// [`Step`] behind [`http_request`]
#[derive(Debug)]
pub struct HttpRequestStep {
    rt: Arc<Runtime>,
    options: HttpRequestOptions,
}

/// Send one request over an [`HttpConnection`]
pub fn http_request(rt: &Arc<Runtime>, options: HttpRequestOptions) -> StepFunc<HttpRequestStep> {
    operation(HttpRequestStep {
        rt: Arc::clone(rt),
        options,
    })
}

/// Host part of the request URL: the domain, or the IP address alone when
/// the port is the scheme default, or the whole address
fn url_host(input: &HttpConnection) -> String {
    if !input.domain.is_empty() {
        return input.domain.clone();
    }
    let (addr, port) = split_host_port(&input.address);
    match (input.scheme.as_str(), port) {
        ("http", 80) | ("https", 443) if addr.contains(':') => format!("[{addr}]"),
        ("http", 80) | ("https", 443) => addr,
        _ => input.address.clone(),
    }
}

impl HttpRequestStep {
    fn new_request(&self, input: &HttpConnection) -> Result<HttpRequest, NetError> {
        let host = url_host(input);
        let path = self.options.url_path.as_deref().unwrap_or("/");
        let url = url::Url::parse(&format!("{}://{host}{path}", input.scheme))
            .map_err(|e| NetError::from_error(Operation::HttpRoundTrip, classify_generic_error, &e))?;

        let options = &self.options;
        let mut headers = vec![
            ("Host".to_string(), options.host.clone().unwrap_or(host)),
            (
                "Accept".to_string(),
                options.accept.clone().unwrap_or_else(|| DEFAULT_ACCEPT.to_string()),
            ),
            (
                "Accept-Language".to_string(),
                options
                    .accept_language
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.to_string()),
            ),
            (
                "User-Agent".to_string(),
                options
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ),
        ];
        if let Some(referer) = &options.referer {
            headers.push(("Referer".to_string(), referer.clone()));
        }
        Ok(HttpRequest {
            method: options.method.clone().unwrap_or_else(|| "GET".to_string()),
            url,
            headers,
        })
    }
}

#[async_trait]
impl Step<HttpConnection, HttpExchange> for HttpRequestStep {
    #[instrument(skip_all, fields(address = %input.address))]
    async fn run(&self, ctx: &Context, input: HttpConnection) -> Maybe<HttpExchange> {
        let trace = Arc::clone(&input.trace);
        let request = match self.new_request(&input) {
            Ok(request) => request,
            Err(err) => return Maybe::new(Err(err), maybe_trace_to_observations(Some(&*trace))),
        };
        let label = format!(
            "[#{}] HTTPRequest {} with {}/{} host={}",
            trace.index(),
            request.url,
            input.address,
            input.network,
            request.header("Host").unwrap_or_default()
        );
        debug!("{label}");

        let max_body = self.rt.config().pipeline.max_body_bytes;
        let started = trace.time_since_zero();
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            started,
            "http_transaction_start",
            trace.tags(),
        ));

        let sampler = SpeedCollector::with_config(Arc::clone(&trace), self.rt.config().sampler.memoryless());
        let ctx = ctx.with_timeout(self.rt.config().timeouts.http_transaction());
        let result = input.transport.round_trip(&ctx, &request, max_body).await;
        sampler.close();

        let finished = trace.time_since_zero();
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            finished,
            "http_transaction_done",
            trace.tags(),
        ));

        let result = result.map_err(|e| new_net_error(Operation::HttpRoundTrip, classify_generic_error, &e));
        let record = new_http_request_result(
            trace.index(),
            started,
            &input.network,
            &input.address,
            &input.tls_negotiated_protocol,
            input.transport.network(),
            Some(&request),
            result.as_ref().ok(),
            max_body,
            result.as_ref().err(),
            finished,
            trace.tags(),
        );

        let mut observations = vec![Observations {
            network_events: sampler.extract_samples(),
            requests: vec![record],
            ..Observations::default()
        }];
        observations.extend(maybe_trace_to_observations(Some(&*trace)));

        let result = match result {
            Ok(response) => {
                debug!("{label}... {}", response.status_code);
                Ok(HttpExchange {
                    address: input.address,
                    domain: input.domain,
                    network: input.network,
                    request,
                    response,
                    trace,
                })
            }
            Err(err) => {
                debug!("{label}... {err}");
                Err(err)
            }
        };
        Maybe::new(result, observations)
    }
}
