//! In-process network emulation
//!
//! [`Netem`] implements [`MeasuringNetwork`] without touching the host
//! network. DNS answers come from configured records, connections reach
//! in-process servers, and [`DpiRule`]s tamper with traffic the way a
//! censoring middlebox would. Pipelines run against it exactly as they run
//! against [`SystemNetwork`](super::SystemNetwork).

use super::{
    BoxConn, Conn, Context, Dialer, DnsError, MeasuringNetwork, QuicConn, QuicDialer, QuicError, Resolver,
    TlsConfig, TlsConnectionState, TlsHandshaker,
};
use crate::failure::{NetError, Operation, SSL_FAILED_HANDSHAKE, SSL_INVALID_HOSTNAME};
use crate::trace::Trace;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;
const TLS_ALERT_NO_APPLICATION_PROTOCOL: u8 = 120;

/// Tampering applied by the emulated middlebox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpiRule {
    /// Silently drop every packet sent to `endpoint`
    DropTrafficForServerEndpoint {
        /// `ip:port` of the victim server
        endpoint: String,
    },
    /// Reset TCP connections whose ClientHello carries `sni`
    ResetTrafficForTlsSni {
        /// Blocked server name
        sni: String,
    },
    /// Drop traffic after a ClientHello (or QUIC Initial) carrying `sni`
    DropTrafficForTlsSni {
        /// Blocked server name
        sni: String,
    },
    /// Answer every query for `domain` with NXDOMAIN
    SpoofNxdomain {
        /// Censored domain
        domain: String,
    },
    /// Answer every query for `domain` with `addresses`
    SpoofDnsResponse {
        /// Censored domain
        domain: String,
        /// Addresses in the forged reply
        addresses: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
struct Server {
    /// Names the certificate is valid for; `None` for plaintext servers
    tls_names: Option<Vec<String>>,
    alpn: Vec<String>,
    quic: bool,
    response: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    records: RwLock<HashMap<String, Vec<String>>>,
    isp_records: RwLock<HashMap<String, Vec<String>>>,
    servers: RwLock<HashMap<SocketAddr, Server>>,
    rules: RwLock<Vec<DpiRule>>,
}

fn canonical_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

impl State {
    fn dns_rule(&self, domain: &str) -> Option<io::Result<Vec<String>>> {
        let domain = canonical_domain(domain);
        self.rules.read().iter().find_map(|rule| match rule {
            DpiRule::SpoofNxdomain { domain: d } if canonical_domain(d) == domain => {
                Some(Err(DnsError::NoSuchHost.into_io()))
            }
            DpiRule::SpoofDnsResponse { domain: d, addresses } if canonical_domain(d) == domain => {
                Some(Ok(addresses.clone()))
            }
            _ => None,
        })
    }

    fn drops_endpoint(&self, endpoint: &str) -> bool {
        self.rules.read().iter().any(|rule| {
            matches!(rule, DpiRule::DropTrafficForServerEndpoint { endpoint: e } if e == endpoint)
        })
    }

    fn sni_rule(&self, sni: &str) -> Option<DpiRule> {
        self.rules
            .read()
            .iter()
            .find(|rule| match rule {
                DpiRule::ResetTrafficForTlsSni { sni: s } | DpiRule::DropTrafficForTlsSni { sni: s } => {
                    s.eq_ignore_ascii_case(sni)
                }
                _ => false,
            })
            .cloned()
    }

    fn server(&self, address: SocketAddr) -> Option<Server> {
        self.servers.read().get(&address).cloned()
    }
}

/// Emulated network with configurable DNS, servers and censorship.
#[derive(Debug, Clone, Default)]
pub struct Netem {
    state: Arc<State>,
}

impl Netem {
    /// An empty network: no records, no servers, no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every resolver answer `domain` with `addresses`
    pub fn add_record(&self, domain: &str, addresses: &[&str]) -> &Self {
        self.state
            .records
            .write()
            .insert(canonical_domain(domain), addresses.iter().map(ToString::to_string).collect());
        self
    }

    /// Make only getaddrinfo answer `domain` with `addresses`, as an ISP
    /// resolver lying to its customers would
    pub fn add_getaddrinfo_record(&self, domain: &str, addresses: &[&str]) -> &Self {
        self.state
            .isp_records
            .write()
            .insert(canonical_domain(domain), addresses.iter().map(ToString::to_string).collect());
        self
    }

    /// Serve `response` over plaintext TCP at `endpoint`
    pub fn add_http_server(&self, endpoint: SocketAddr, response: impl Into<Vec<u8>>) -> &Self {
        self.state.servers.write().insert(
            endpoint,
            Server {
                response: response.into(),
                ..Server::default()
            },
        );
        self
    }

    /// Serve `response` over TLS at `endpoint`, with a certificate valid
    /// for `names` and the given ALPN protocols. QUIC is accepted too.
    pub fn add_https_server(
        &self,
        endpoint: SocketAddr,
        names: &[&str],
        alpn: &[&str],
        response: impl Into<Vec<u8>>,
    ) -> &Self {
        self.state.servers.write().insert(
            endpoint,
            Server {
                tls_names: Some(names.iter().map(ToString::to_string).collect()),
                alpn: alpn.iter().map(ToString::to_string).collect(),
                quic: true,
                response: response.into(),
            },
        );
        self
    }

    /// Install a censorship rule
    pub fn add_dpi_rule(&self, rule: DpiRule) -> &Self {
        self.state.rules.write().push(rule);
        self
    }
}

impl MeasuringNetwork for Netem {
    fn new_stdlib_resolver(&self) -> Arc<dyn Resolver> {
        Arc::new(NetemResolver {
            state: Arc::clone(&self.state),
            server: None,
        })
    }

    fn new_udp_resolver(&self, address: &str) -> Arc<dyn Resolver> {
        Arc::new(NetemResolver {
            state: Arc::clone(&self.state),
            server: Some(address.to_string()),
        })
    }

    fn new_dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(NetemDialer {
            state: Arc::clone(&self.state),
        })
    }

    fn new_tls_handshaker(&self) -> Arc<dyn TlsHandshaker> {
        Arc::new(NetemTlsHandshaker {
            state: Arc::clone(&self.state),
        })
    }

    fn new_quic_dialer(&self) -> Arc<dyn QuicDialer> {
        Arc::new(NetemQuicDialer {
            state: Arc::clone(&self.state),
        })
    }
}

/// Wait until `ctx` gives up, as a dropped packet makes the sender do
async fn blackhole<T>(ctx: &Context) -> io::Result<T> {
    ctx.guard(std::future::pending()).await
}

fn parse_endpoint(address: &str) -> io::Result<SocketAddr> {
    address.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not an ip:port endpoint: {address}"),
        )
    })
}

// ============ Resolvers ============

/// getaddrinfo when `server` is unset, DNS over UDP otherwise
struct NetemResolver {
    state: Arc<State>,
    server: Option<String>,
}

#[async_trait]
impl Resolver for NetemResolver {
    async fn lookup_host(
        &self,
        ctx: &Context,
        domain: &str,
        trace: Option<&Trace>,
    ) -> io::Result<Vec<String>> {
        debug!(
            "[#{}] netem lookup {domain} via {}",
            trace.map_or(0, Trace::index),
            self.network()
        );
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip.to_string()]);
        }
        if let Some(server) = &self.server {
            if self.state.drops_endpoint(server) {
                return blackhole(ctx).await;
            }
        }
        if let Some(spoofed) = self.state.dns_rule(domain) {
            return spoofed;
        }

        let key = canonical_domain(domain);
        let isp = self
            .server
            .is_none()
            .then(|| self.state.isp_records.read().get(&key).cloned())
            .flatten();
        isp.or_else(|| self.state.records.read().get(&key).cloned())
            .ok_or_else(|| DnsError::NoSuchHost.into_io())
    }

    fn network(&self) -> &str {
        if self.server.is_some() {
            "udp"
        } else {
            "getaddrinfo"
        }
    }

    fn address(&self) -> &str {
        self.server.as_deref().unwrap_or_default()
    }
}

// ============ TCP ============

/// In-memory stream standing in for a TCP connection
pub struct NetemConn {
    inner: DuplexStream,
    remote: SocketAddr,
}

/// A connected pair: a conn to `remote` and the server's end of it
pub fn pipe(remote: SocketAddr) -> (NetemConn, DuplexStream) {
    let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
    (NetemConn { inner: client, remote }, server)
}

impl AsyncRead for NetemConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for NetemConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for NetemConn {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

/// Read one request head, answer with `response`, hang up
async fn serve(mut stream: DuplexStream, response: Vec<u8>) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    if stream.write_all(&response).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

struct NetemDialer {
    state: Arc<State>,
}

#[async_trait]
impl Dialer for NetemDialer {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
        trace: Option<&Trace>,
    ) -> io::Result<BoxConn> {
        debug!("[#{}] netem dial {network} {address}", trace.map_or(0, Trace::index));
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network: {network}"),
            ));
        }
        let remote = parse_endpoint(address)?;
        if self.state.drops_endpoint(address) {
            return blackhole(ctx).await;
        }
        let server = self
            .state
            .server(remote)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let (conn, server_end) = pipe(remote);
        tokio::spawn(serve(server_end, server.response));
        Ok(Box::new(conn))
    }
}

// ============ TLS ============

fn fake_certificate(name: &str) -> Vec<u8> {
    format!("netem certificate for {name}").into_bytes()
}

fn negotiate_alpn(offered: &[String], supported: &[String]) -> String {
    offered
        .iter()
        .find(|p| supported.contains(p))
        .cloned()
        .unwrap_or_default()
}

fn handshake_state(server: &Server, config: &TlsConfig) -> TlsConnectionState {
    TlsConnectionState {
        cipher_suite: "TLS13_AES_128_GCM_SHA256".to_string(),
        negotiated_protocol: negotiate_alpn(&config.next_protos, &server.alpn),
        tls_version: "TLSv1.3".to_string(),
        peer_certificates: vec![fake_certificate(&config.server_name)],
    }
}

/// Whether `server` can complete a handshake for `config`
fn check_certificate(server: &Server, config: &TlsConfig, operation: Operation) -> io::Result<()> {
    let Some(names) = &server.tls_names else {
        return Err(NetError::new(operation, SSL_FAILED_HANDSHAKE).into_io());
    };
    let valid = names.iter().any(|n| n.eq_ignore_ascii_case(&config.server_name));
    if !valid && !config.insecure_skip_verify {
        return Err(NetError::new(operation, SSL_INVALID_HOSTNAME).into_io());
    }
    Ok(())
}

struct NetemTlsHandshaker {
    state: Arc<State>,
}

#[async_trait]
impl TlsHandshaker for NetemTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
        _trace: Option<&Trace>,
    ) -> io::Result<(BoxConn, TlsConnectionState)> {
        match self.state.sni_rule(&config.server_name) {
            Some(DpiRule::ResetTrafficForTlsSni { .. }) => {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            Some(_) => return blackhole(ctx).await,
            None => {}
        }
        let server = conn
            .remote_addr()
            .and_then(|remote| self.state.server(remote))
            .unwrap_or_default();
        check_certificate(&server, config, Operation::TlsHandshake)?;
        let state = handshake_state(&server, config);
        Ok((conn, state))
    }
}

// ============ QUIC ============

/// Established emulated QUIC connection
#[derive(Debug)]
pub struct NetemQuicConn {
    remote: SocketAddr,
}

impl QuicConn for NetemQuicConn {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

struct NetemQuicDialer {
    state: Arc<State>,
}

#[async_trait]
impl QuicDialer for NetemQuicDialer {
    async fn dial(
        &self,
        ctx: &Context,
        address: &str,
        config: &TlsConfig,
        _trace: Option<&Trace>,
    ) -> io::Result<(Box<dyn QuicConn>, TlsConnectionState)> {
        let remote = parse_endpoint(address)?;
        let server = match self.state.server(remote) {
            Some(server) if server.quic => server,
            // nobody answers the Initial packets
            _ => return blackhole(ctx).await,
        };
        if self.state.drops_endpoint(address) || self.state.sni_rule(&config.server_name).is_some() {
            return blackhole(ctx).await;
        }
        check_certificate(&server, config, Operation::QuicHandshake)?;
        let state = handshake_state(&server, config);
        if state.negotiated_protocol.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                QuicError::Crypto {
                    alert: TLS_ALERT_NO_APPLICATION_PROTOCOL,
                },
            ));
        }
        Ok((Box::new(NetemQuicConn { remote }), state))
    }
}
