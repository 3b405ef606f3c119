//! Network primitives
//!
//! Narrow capability traits for the operations a measurement performs:
//! resolving, dialing, TLS and QUIC handshakes, HTTP round trips. Every
//! method receives the [`Trace`] it should report to explicitly, so nested
//! primitives (a resolver using sockets, a transport reading from a conn)
//! contribute to the same trace without any ambient state.
//!
//! [`SystemNetwork`] implements them on top of tokio and rustls, [`Netem`]
//! on top of an emulated network with configurable censorship.

pub mod bogon;
mod context;
pub mod dnsoverudp;
pub mod http1;
pub mod netem;
pub mod system;
mod tracked;

pub use bogon::is_bogon;
pub use context::Context;
pub use http1::Http1Transport;
pub use netem::{DpiRule, Netem};
pub use system::SystemNetwork;
pub use tracked::TrackedConn;

use crate::failure;
use crate::trace::Trace;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream to a remote endpoint.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {
    /// Remote endpoint, when known
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Network of the underlying socket
    fn network(&self) -> &'static str {
        "tcp"
    }
}

/// Boxed [`Conn`]
pub type BoxConn = Box<dyn Conn>;

impl Conn for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Conn for BoxConn {
    fn remote_addr(&self) -> Option<SocketAddr> {
        (**self).remote_addr()
    }

    fn network(&self) -> &'static str {
        (**self).network()
    }
}

impl<C: Conn> Conn for tokio_rustls::client::TlsStream<C> {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.remote_addr()
    }

    fn network(&self) -> &'static str {
        self.get_ref().0.network()
    }
}

/// Resolves domain names to IP addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `domain`, returning textual IP addresses
    async fn lookup_host(
        &self,
        ctx: &Context,
        domain: &str,
        trace: Option<&Trace>,
    ) -> io::Result<Vec<String>>;

    /// Resolver kind, used as the `engine` of DNS records
    fn network(&self) -> &str;

    /// Resolver endpoint, empty when not applicable
    fn address(&self) -> &str;
}

/// Opens stream connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address` (an `ip:port` endpoint) over `network`
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
        trace: Option<&Trace>,
    ) -> io::Result<BoxConn>;
}

/// TLS client settings.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// SNI and name to verify the certificate against
    pub server_name: String,
    /// ALPN protocols to offer
    pub next_protos: Vec<String>,
    /// Skip certificate verification
    pub insecure_skip_verify: bool,
    /// Trust anchors; the platform store is used when unset
    pub root_certs: Option<Arc<rustls::RootCertStore>>,
}

/// What a successful handshake negotiated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionState {
    /// Cipher suite name
    pub cipher_suite: String,
    /// Negotiated ALPN, empty if none
    pub negotiated_protocol: String,
    /// Protocol version (`TLSv1.3`, ...)
    pub tls_version: String,
    /// DER certificates sent by the peer, leaf first
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Performs TLS handshakes over established connections.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    /// Run the client handshake over `conn`. `conn` is consumed on failure.
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
        trace: Option<&Trace>,
    ) -> io::Result<(BoxConn, TlsConnectionState)>;
}

/// An established QUIC connection.
pub trait QuicConn: Send + Sync {
    /// Remote endpoint
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Dials QUIC connections.
#[async_trait]
pub trait QuicDialer: Send + Sync {
    /// Open a QUIC connection to `address`, handshaking with `config`
    async fn dial(
        &self,
        ctx: &Context,
        address: &str,
        config: &TlsConfig,
        trace: Option<&Trace>,
    ) -> io::Result<(Box<dyn QuicConn>, TlsConnectionState)>;
}

/// QUIC-level failures reported by [`QuicDialer`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuicError {
    /// No common QUIC version
    #[error("no compatible QUIC version found")]
    VersionNegotiation,
    /// Peer sent a stateless reset
    #[error("received a stateless reset")]
    StatelessReset,
    /// Handshake did not complete in time
    #[error("timeout: handshake did not complete in time")]
    HandshakeTimeout,
    /// Connection idle for too long
    #[error("timeout: no recent network activity")]
    IdleTimeout,
    /// TLS alert carried in a CRYPTO_ERROR
    #[error("CRYPTO_ERROR: TLS alert {alert}")]
    Crypto {
        /// TLS alert code
        alert: u8,
    },
    /// Any other transport error code
    #[error("transport error {code:#x}")]
    Transport {
        /// QUIC transport error code
        code: u64,
    },
}

/// DNS-level failures reported by [`Resolver`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// NXDOMAIN
    #[error("no such host")]
    NoSuchHost,
    /// REFUSED
    #[error("query refused")]
    Refused,
    /// SERVFAIL
    #[error("server failure")]
    ServFail,
    /// Malformed or unexpected reply
    #[error("server misbehaving")]
    Misbehaving,
    /// Reply without usable records
    #[error("no answer from DNS server")]
    NoAnswer,
    /// Reply with a bogon address
    #[error("dns reply with bogon address")]
    Bogon,
    /// Reply with a query ID we did not send
    #[error("dns reply with wrong query ID")]
    WrongQueryId,
}

impl DnsError {
    /// Canonical failure string
    pub fn failure(&self) -> &'static str {
        match self {
            Self::NoSuchHost => failure::DNS_NXDOMAIN_ERROR,
            Self::Refused => failure::DNS_REFUSED_ERROR,
            Self::ServFail => failure::DNS_SERVFAIL_ERROR,
            Self::Misbehaving => failure::DNS_SERVER_MISBEHAVING,
            Self::NoAnswer => failure::DNS_NO_ANSWER,
            Self::Bogon => failure::DNS_BOGON_ERROR,
            Self::WrongQueryId => failure::DNS_REPLY_WITH_WRONG_QUERY_ID,
        }
    }

    /// Wrap into an [`io::Error`]
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: String,
    /// Absolute URL
    pub url: url::Url,
    /// Headers in sending order, `Host` included
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// A `GET` for `url` with only the `Host` header
    pub fn get(url: url::Url) -> Self {
        let host = url_host(&url);
        Self {
            method: "GET".to_string(),
            url,
            headers: vec![("Host".to_string(), host)],
        }
    }

    /// First value of a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Set a header, replacing any previous value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }
}

/// An HTTP response with a body snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status_code: u16,
    /// Headers in receiving order
    pub headers: Vec<(String, String)>,
    /// Body, capped at the snapshot limit
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First value of a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// `host[:port]` as it should appear in a `Host` header
pub(crate) fn url_host(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Performs HTTP round trips.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `req` and read at most `max_body` bytes of the response body
    async fn round_trip(
        &self,
        ctx: &Context,
        req: &HttpRequest,
        max_body: usize,
    ) -> io::Result<HttpResponse>;

    /// Network of the underlying connection
    fn network(&self) -> &str;
}

/// Factory for the primitives a measurement needs.
pub trait MeasuringNetwork: Send + Sync {
    /// The system resolver (getaddrinfo)
    fn new_stdlib_resolver(&self) -> Arc<dyn Resolver>;

    /// A resolver sending A and AAAA queries in parallel to `address` over UDP
    fn new_udp_resolver(&self, address: &str) -> Arc<dyn Resolver>;

    /// A dialer that does not resolve names
    fn new_dialer(&self) -> Arc<dyn Dialer>;

    /// A TLS handshaker
    fn new_tls_handshaker(&self) -> Arc<dyn TlsHandshaker>;

    /// A QUIC dialer
    fn new_quic_dialer(&self) -> Arc<dyn QuicDialer>;
}
