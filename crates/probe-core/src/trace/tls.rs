use super::Trace;
use crate::archival::{new_annotation_network_event, new_tls_or_quic_handshake_result};
use crate::failure::{classify_tls_handshake_error, new_net_error, Operation};
use crate::netx::{BoxConn, Context, TlsConfig, TlsConnectionState, TlsHandshaker};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// TLS handshaker reporting every handshake to its [`Trace`].
pub struct TracedTlsHandshaker {
    trace: Arc<Trace>,
    inner: Arc<dyn TlsHandshaker>,
}

impl TracedTlsHandshaker {
    pub(super) fn new(trace: Arc<Trace>, inner: Arc<dyn TlsHandshaker>) -> Self {
        Self { trace, inner }
    }
}

#[async_trait]
impl TlsHandshaker for TracedTlsHandshaker {
    async fn handshake(
        &self,
        ctx: &Context,
        conn: BoxConn,
        config: &TlsConfig,
        _trace: Option<&Trace>,
    ) -> io::Result<(BoxConn, TlsConnectionState)> {
        let trace = &*self.trace;
        let network = conn.network();
        let address = conn
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        let started = trace.time_since_zero();
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            started,
            "tls_handshake_start",
            trace.tags(),
        ));

        let result = ctx
            .guard(self.inner.handshake(ctx, conn, config, Some(trace)))
            .await;

        let finished = trace.time_since_zero();
        let err = result
            .as_ref()
            .err()
            .map(|e| new_net_error(Operation::TlsHandshake, classify_tls_handshake_error, e));
        let state = result.as_ref().ok().map(|(_, state)| state);
        trace.push_tls_handshake(new_tls_or_quic_handshake_result(
            trace.index(),
            started,
            network,
            &address,
            config,
            state,
            err.as_ref(),
            finished,
            trace.tags(),
        ));
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            finished,
            "tls_handshake_done",
            trace.tags(),
        ));

        result
    }
}
