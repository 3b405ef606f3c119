//! QUIC handshake step

use super::address::Endpoint;
use super::fxcore::{operation, Maybe, Step, StepFunc};
use super::observations::maybe_trace_to_observations;
use super::runtime::Runtime;
use super::tls::default_server_name;
use crate::failure::{classify_quic_handshake_error, new_net_error, Operation};
use crate::netx::{Context, QuicConn, QuicDialer, TlsConfig, TlsConnectionState, TrackedConn};
use crate::trace::Trace;
use async_trait::async_trait;
use rustls::RootCertStore;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Settings of [`quic_handshake`].
#[derive(Debug, Clone, Default)]
pub struct QuicHandshakeOptions {
    /// SNI; defaults to the endpoint domain, or its IP address
    pub server_name: Option<String>,
    /// ALPN; defaults to `h3`
    pub next_protos: Option<Vec<String>>,
    /// Skip certificate verification
    pub insecure_skip_verify: bool,
    /// Trust anchors; defaults to the platform store
    pub root_certs: Option<Arc<RootCertStore>>,
}

impl QuicHandshakeOptions {
    /// Set the SNI
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Skip certificate verification
    #[must_use]
    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }
}

/// An established QUIC connection.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    /// Remote `ip:port`
    pub address: String,
    /// The connection, also tracked by the runtime
    pub conn: TrackedConn<Box<dyn QuicConn>>,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// Always `udp`
    pub network: String,
    /// What the handshake negotiated
    pub state: TlsConnectionState,
    /// Trace of the handshake
    pub trace: Arc<Trace>,
}

/// [`Step`] behind [`quic_handshake`]
#[derive(Debug)]
pub struct QuicHandshake {
    rt: Arc<Runtime>,
    options: QuicHandshakeOptions,
}

/// Dial QUIC to an endpoint
pub fn quic_handshake(rt: &Arc<Runtime>, options: QuicHandshakeOptions) -> StepFunc<QuicHandshake> {
    operation(QuicHandshake {
        rt: Arc::clone(rt),
        options,
    })
}

#[async_trait]
impl Step<Endpoint, QuicConnection> for QuicHandshake {
    #[instrument(skip_all, fields(address = %input.address))]
    async fn run(&self, ctx: &Context, input: Endpoint) -> Maybe<QuicConnection> {
        let config = TlsConfig {
            server_name: self
                .options
                .server_name
                .clone()
                .unwrap_or_else(|| default_server_name(&input.domain, &input.address)),
            next_protos: self
                .options
                .next_protos
                .clone()
                .unwrap_or_else(|| vec!["h3".to_string()]),
            insecure_skip_verify: self.options.insecure_skip_verify,
            root_certs: self.options.root_certs.clone(),
        };
        let trace = self.rt.new_trace(input.tags);
        let dialer = trace.new_quic_dialer(self.rt.network());
        let label = format!(
            "[#{}] QUICHandshake with {} SNI={} ALPN={:?}",
            trace.index(),
            input.address,
            config.server_name,
            config.next_protos
        );
        debug!("{label}");

        let ctx = ctx.with_timeout(self.rt.config().timeouts.quic_handshake());
        let result = dialer.dial(&ctx, &input.address, &config, Some(&*trace)).await;
        let observations = maybe_trace_to_observations(Some(&*trace));

        let result = match result {
            Ok((conn, state)) => {
                debug!("{label}... {}", state.negotiated_protocol);
                let conn = TrackedConn::new(conn);
                self.rt.track(Some(Arc::new(conn.clone())));
                Ok(QuicConnection {
                    address: input.address,
                    conn,
                    domain: input.domain,
                    network: "udp".to_string(),
                    state,
                    trace,
                })
            }
            Err(e) => {
                let err = new_net_error(Operation::QuicHandshake, classify_quic_handshake_error, &e);
                debug!("{label}... {err}");
                Err(err)
            }
        };
        Maybe::new(result, observations)
    }
}
