//! TLS handshake step

use super::fxcore::{operation, Maybe, Step, StepFunc};
use super::observations::maybe_trace_to_observations;
use super::runtime::Runtime;
use super::tcp::TcpConnection;
use crate::archival::split_host_port;
use crate::failure::{classify_tls_handshake_error, new_net_error, NetError, Operation, CONNECTION_ALREADY_CLOSED};
use crate::netx::{BoxConn, Context, TlsConfig, TlsConnectionState, TlsHandshaker, TrackedConn};
use crate::trace::Trace;
use async_trait::async_trait;
use rustls::RootCertStore;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Settings of [`tls_handshake`]. Unset fields get sensible defaults.
#[derive(Debug, Clone, Default)]
pub struct TlsHandshakeOptions {
    /// SNI; defaults to the domain of the connection, or its IP address
    pub server_name: Option<String>,
    /// ALPN; defaults to `h2` and `http/1.1`
    pub next_protos: Option<Vec<String>>,
    /// Skip certificate verification
    pub insecure_skip_verify: bool,
    /// Trust anchors; defaults to the platform store
    pub root_certs: Option<Arc<RootCertStore>>,
}

impl TlsHandshakeOptions {
    /// Set the SNI
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the ALPN protocols
    #[must_use]
    pub fn next_protos<I, S>(mut self, protos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_protos = Some(protos.into_iter().map(Into::into).collect());
        self
    }

    /// Skip certificate verification
    #[must_use]
    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Use these trust anchors
    #[must_use]
    pub fn root_certs(mut self, roots: Arc<RootCertStore>) -> Self {
        self.root_certs = Some(roots);
        self
    }
}

/// A connection after a successful TLS handshake.
#[derive(Debug, Clone)]
pub struct TlsConnection {
    /// Remote `ip:port`
    pub address: String,
    /// The TLS connection, also tracked by the runtime
    pub conn: TrackedConn<BoxConn>,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// Always `tcp`
    pub network: String,
    /// What the handshake negotiated
    pub state: TlsConnectionState,
    /// Trace inherited from the TCP connection
    pub trace: Arc<Trace>,
}

/// [`Step`] behind [`tls_handshake`]
#[derive(Debug)]
pub struct TlsHandshake {
    rt: Arc<Runtime>,
    options: TlsHandshakeOptions,
}

/// Handshake TLS over a TCP connection
pub fn tls_handshake(rt: &Arc<Runtime>, options: TlsHandshakeOptions) -> StepFunc<TlsHandshake> {
    operation(TlsHandshake {
        rt: Arc::clone(rt),
        options,
    })
}

/// SNI for a connection to `address` resolved from `domain`
pub(crate) fn default_server_name(domain: &str, address: &str) -> String {
    if domain.is_empty() {
        split_host_port(address).0
    } else {
        domain.to_string()
    }
}

impl TlsHandshake {
    fn config(&self, input: &TcpConnection) -> TlsConfig {
        TlsConfig {
            server_name: self
                .options
                .server_name
                .clone()
                .unwrap_or_else(|| default_server_name(&input.domain, &input.address)),
            next_protos: self
                .options
                .next_protos
                .clone()
                .unwrap_or_else(|| vec!["h2".to_string(), "http/1.1".to_string()]),
            insecure_skip_verify: self.options.insecure_skip_verify,
            root_certs: self.options.root_certs.clone(),
        }
    }
}

#[async_trait]
impl Step<TcpConnection, TlsConnection> for TlsHandshake {
    #[instrument(skip_all, fields(address = %input.address))]
    async fn run(&self, ctx: &Context, input: TcpConnection) -> Maybe<TlsConnection> {
        let config = self.config(&input);
        let trace = Arc::clone(&input.trace);
        let handshaker = trace.new_tls_handshaker(self.rt.network());
        let label = format!(
            "[#{}] TLSHandshake with {} SNI={} ALPN={:?}",
            trace.index(),
            input.address,
            config.server_name,
            config.next_protos
        );
        debug!("{label}");

        let result = match input.conn.take() {
            Some(conn) => {
                let ctx = ctx.with_timeout(self.rt.config().timeouts.tls_handshake());
                handshaker
                    .handshake(&ctx, conn, &config, Some(&*trace))
                    .await
                    .map_err(|e| new_net_error(Operation::TlsHandshake, classify_tls_handshake_error, &e))
            }
            None => Err(NetError::new(Operation::TlsHandshake, CONNECTION_ALREADY_CLOSED)),
        };
        let observations = maybe_trace_to_observations(Some(&*trace));

        let result = match result {
            Ok((conn, state)) => {
                debug!("{label}... {}", state.tls_version);
                let conn = TrackedConn::new(conn);
                self.rt.track(Some(Arc::new(conn.clone())));
                Ok(TlsConnection {
                    address: input.address,
                    conn,
                    domain: input.domain,
                    network: input.network,
                    state,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dslx::address::Endpoint;
    use crate::dslx::fxcore::Func;
    use crate::dslx::tcp::tcp_connect;
    use crate::failure::{CONNECTION_RESET, INTERRUPTED, SSL_INVALID_HOSTNAME};
    use crate::netx::{DpiRule, Netem};

    fn netem() -> Netem {
        let netem = Netem::new();
        netem.add_https_server(
            "93.184.216.34:443".parse().unwrap(),
            &["example.com"],
            &["http/1.1"],
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        netem
    }

    async fn handshake(netem: Netem, domain: &str, options: TlsHandshakeOptions) -> Maybe<TlsConnection> {
        let rt = Arc::new(Runtime::new(Arc::new(netem)));
        let pipeline = crate::compose!(tcp_connect(&rt), tls_handshake(&rt, options));
        let input = Endpoint::new("tcp", "93.184.216.34:443").with_domain(domain);
        pipeline.apply(&Context::new(), Maybe::ok(input)).await
    }

    #[test]
    fn test_default_server_name() {
        assert_eq!(default_server_name("example.com", "93.184.216.34:443"), "example.com");
        assert_eq!(default_server_name("", "93.184.216.34:443"), "93.184.216.34");
        assert_eq!(default_server_name("", "[2606:2800:220:1::]:443"), "2606:2800:220:1::");
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let out = handshake(netem(), "example.com", TlsHandshakeOptions::default()).await;
        let state = out.state().unwrap();
        assert_eq!(state.state.negotiated_protocol, "http/1.1");
        assert_eq!(state.trace.index(), 1);

        // one list from the connect, one from the handshake
        assert_eq!(out.observations.len(), 2);
        let handshakes = &out.observations[1].tls_handshakes;
        assert_eq!(handshakes.len(), 1);
        assert_eq!(handshakes[0].server_name, "example.com");
        assert_eq!(handshakes[0].failure, None);
        assert_eq!(handshakes[0].address, "93.184.216.34:443");
    }

    #[tokio::test]
    async fn test_handshake_reset() {
        let netem = netem();
        netem.add_dpi_rule(DpiRule::ResetTrafficForTlsSni {
            sni: "example.com".to_string(),
        });
        let out = handshake(netem, "example.com", TlsHandshakeOptions::default()).await;
        let err = out.error().unwrap();
        assert_eq!(err.failure, CONNECTION_RESET);
        assert_eq!(err.operation, Operation::TlsHandshake);
        assert_eq!(
            out.observations[1].tls_handshakes[0].failure.as_deref(),
            Some(CONNECTION_RESET)
        );
    }

    #[tokio::test]
    async fn test_handshake_cancelled() {
        let netem = netem();
        netem.add_dpi_rule(DpiRule::DropTrafficForTlsSni {
            sni: "example.com".to_string(),
        });
        let rt = Arc::new(Runtime::new(Arc::new(netem)));
        let ctx = Context::new();
        let pending = {
            let rt = Arc::clone(&rt);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let pipeline = crate::compose!(
                    tcp_connect(&rt),
                    tls_handshake(&rt, TlsHandshakeOptions::default())
                );
                let input = Endpoint::new("tcp", "93.184.216.34:443").with_domain("example.com");
                pipeline.apply(&ctx, Maybe::ok(input)).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ctx.cancel();

        let out = pending.await.unwrap();
        let err = out.error().unwrap();
        assert_eq!(err.failure, INTERRUPTED);
        assert_eq!(err.operation, Operation::TlsHandshake);

        // the connect succeeded, the handshake is archived as interrupted
        assert!(out.observations[0].tcp_connect[0].status.success);
        let handshakes = &out.observations[1].tls_handshakes;
        assert_eq!(handshakes.len(), 1);
        assert_eq!(handshakes[0].failure.as_deref(), Some(INTERRUPTED));
        rt.close();
    }

    #[tokio::test]
    async fn test_handshake_options() {
        let options = TlsHandshakeOptions::default()
            .server_name("www.example.org")
            .next_protos(["h2"]);
        let out = handshake(netem(), "example.com", options.clone()).await;
        assert_eq!(out.error().map(NetError::failure), Some(SSL_INVALID_HOSTNAME));

        let out = handshake(netem(), "example.com", options.insecure_skip_verify(true)).await;
        let state = out.state().unwrap();
        assert_eq!(state.state.negotiated_protocol, "");
        assert!(out.observations[1].tls_handshakes[0].no_tls_verify);
    }

    #[tokio::test]
    async fn test_handshake_on_closed_connection() {
        let rt = Arc::new(Runtime::new(Arc::new(netem())));
        let tcp = tcp_connect(&rt)
            .apply(&Context::new(), Maybe::ok(Endpoint::new("tcp", "93.184.216.34:443")))
            .await;
        rt.close();

        let out = tls_handshake(&rt, TlsHandshakeOptions::default())
            .apply(&Context::new(), tcp)
            .await;
        assert_eq!(out.error().map(NetError::failure), Some(CONNECTION_ALREADY_CLOSED));
    }
}
