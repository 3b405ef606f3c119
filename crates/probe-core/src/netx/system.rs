//! Primitives backed by the operating system, tokio and rustls

use super::dnsoverudp::UdpResolver;
use super::{
    BoxConn, Context, Dialer, MeasuringNetwork, QuicConn, QuicDialer, Resolver, TlsConfig,
    TlsConnectionState, TlsHandshaker,
};
use crate::failure::{NetError, Operation};
use crate::trace::Trace;
use async_trait::async_trait;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ProtocolVersion, RootCertStore, ServerName};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// The [`MeasuringNetwork`] of the host we are running on.
#[derive(Debug, Clone, Default)]
pub struct SystemNetwork {
    roots: Arc<OnceLock<Arc<RootCertStore>>>,
}

impl SystemNetwork {
    /// Create a network using the platform trust store for TLS
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeasuringNetwork for SystemNetwork {
    fn new_stdlib_resolver(&self) -> Arc<dyn Resolver> {
        Arc::new(SystemResolver)
    }

    fn new_udp_resolver(&self, address: &str) -> Arc<dyn Resolver> {
        Arc::new(UdpResolver::new(address))
    }

    fn new_dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(SystemDialer)
    }

    fn new_tls_handshaker(&self) -> Arc<dyn TlsHandshaker> {
        Arc::new(RustlsHandshaker {
            roots: Arc::clone(&self.roots),
        })
    }

    fn new_quic_dialer(&self) -> Arc<dyn QuicDialer> {
        Arc::new(UnsupportedQuicDialer)
    }
}

fn trace_index(trace: Option<&Trace>) -> i64 {
    trace.map_or(0, Trace::index)
}

// ============ getaddrinfo ============

/// Resolver using the system's getaddrinfo
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(
        &self,
        ctx: &Context,
        domain: &str,
        trace: Option<&Trace>,
    ) -> io::Result<Vec<String>> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip.to_string()]);
        }

        debug!("[#{}] getaddrinfo {domain}", trace_index(trace));
        let resolved = ctx.guard(tokio::net::lookup_host((domain, 0))).await?;

        let mut addrs: Vec<String> = Vec::new();
        for addr in resolved {
            let ip = addr.ip().to_string();
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
        if addrs.is_empty() {
            return Err(super::DnsError::NoAnswer.into_io());
        }
        Ok(addrs)
    }

    fn network(&self) -> &str {
        "getaddrinfo"
    }

    fn address(&self) -> &str {
        ""
    }
}

// ============ TCP ============

/// Dialer connecting to `ip:port` endpoints only
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
        trace: Option<&Trace>,
    ) -> io::Result<BoxConn> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network: {network}"),
            ));
        }
        let addr: SocketAddr = address.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dialer without resolver: not an endpoint: {address}"),
            )
        })?;

        debug!("[#{}] TCPConnect {address}", trace_index(trace));
        let stream = ctx.guard(TcpStream::connect(addr)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed on {address}: {e}");
        }
        Ok(Box::new(stream))
    }
}

// ============ TLS ============

/// Handshaker built on rustls
#[derive(Debug, Clone, Default)]
pub struct RustlsHandshaker {
    roots: Arc<OnceLock<Arc<RootCertStore>>>,
}

impl RustlsHandshaker {
    fn platform_roots(&self) -> Arc<RootCertStore> {
        let roots = self.roots.get_or_init(|| {
            let mut store = RootCertStore::empty();
            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    for cert in certs {
                        if let Err(e) = store.add(&Certificate(cert.0)) {
                            debug!("skipping platform certificate: {e}");
                        }
                    }
                }
                Err(e) => warn!("cannot load platform trust store: {e}"),
            }
            Arc::new(store)
        });
        Arc::clone(roots)
    }

    fn client_config(&self, config: &TlsConfig) -> Arc<ClientConfig> {
        let roots = match &config.root_certs {
            Some(roots) => RootCertStore::clone(roots),
            None => RootCertStore::clone(&self.platform_roots()),
        };
        let mut client = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = config
            .next_protos
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect();
        if config.insecure_skip_verify {
            client
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }
        Arc::new(client)
    }
}

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl TlsHandshaker for RustlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
        trace: Option<&Trace>,
    ) -> io::Result<(BoxConn, TlsConnectionState)> {
        let server_name = ServerName::try_from(config.server_name.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connector = TlsConnector::from(self.client_config(config));

        debug!(
            "[#{}] TLSHandshake {} sni={} alpn={:?}",
            trace_index(trace),
            conn.remote_addr().map(|a| a.to_string()).unwrap_or_default(),
            config.server_name,
            config.next_protos,
        );
        let stream = ctx.guard(connector.connect(server_name, conn)).await?;

        let (_, session) = stream.get_ref();
        let state = TlsConnectionState {
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite()))
                .unwrap_or_default(),
            negotiated_protocol: session
                .alpn_protocol()
                .map(|proto| String::from_utf8_lossy(proto).into_owned())
                .unwrap_or_default(),
            tls_version: session
                .protocol_version()
                .map(tls_version_name)
                .unwrap_or_default(),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.0.clone()).collect())
                .unwrap_or_default(),
        };
        Ok((Box::new(stream), state))
    }
}

// ============ QUIC ============

/// QUIC dialer for hosts without a QUIC stack: every dial fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedQuicDialer;

#[async_trait]
impl QuicDialer for UnsupportedQuicDialer {
    async fn dial(
        &self,
        _ctx: &Context,
        address: &str,
        _config: &TlsConfig,
        trace: Option<&Trace>,
    ) -> io::Result<(Box<dyn QuicConn>, TlsConnectionState)> {
        debug!("[#{}] QUICDial {address}: no QUIC transport", trace_index(trace));
        Err(NetError::new(
            Operation::QuicHandshake,
            "unknown_failure: QUIC transport not available",
        )
        .into_io())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{classify_generic_error, CONNECTION_REFUSED};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_resolver_passes_ip_literals_through() {
        let resolver = SystemResolver;
        let addrs = resolver
            .lookup_host(&Context::new(), "8.8.4.4", None)
            .await
            .unwrap();
        assert_eq!(addrs, vec!["8.8.4.4".to_string()]);
        assert_eq!(resolver.network(), "getaddrinfo");
    }

    #[tokio::test]
    async fn test_dialer_rejects_domain_endpoints() {
        let err = SystemDialer
            .dial(&Context::new(), "tcp", "example.com:443", None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_dialer_connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let mut conn = SystemDialer
            .dial(&Context::new(), "tcp", &address, None)
            .await
            .unwrap();
        assert_eq!(conn.remote_addr().unwrap().to_string(), address);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dialer_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = SystemDialer
            .dial(&Context::new(), "tcp", &address, None)
            .await
            .err()
            .unwrap();
        assert_eq!(classify_generic_error(&err), CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn test_quic_dialer_fails() {
        let err = UnsupportedQuicDialer
            .dial(&Context::new(), "8.8.8.8:443", &TlsConfig::default(), None)
            .await
            .err()
            .unwrap();
        assert!(classify_generic_error(&err).starts_with("unknown_failure: "));
    }

    #[test]
    fn test_tls_version_names() {
        assert_eq!(tls_version_name(ProtocolVersion::TLSv1_3), "TLSv1.3");
        assert_eq!(tls_version_name(ProtocolVersion::TLSv1_2), "TLSv1.2");
    }
}
