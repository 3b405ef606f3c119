use super::Trace;
use crate::archival::{new_annotation_network_event, new_tls_or_quic_handshake_result};
use crate::failure::{classify_quic_handshake_error, new_net_error, Operation};
use crate::netx::{Context, QuicConn, QuicDialer, TlsConfig, TlsConnectionState};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// QUIC dialer reporting every handshake to its [`Trace`].
pub struct TracedQuicDialer {
    trace: Arc<Trace>,
    inner: Arc<dyn QuicDialer>,
}

impl TracedQuicDialer {
    pub(super) fn new(trace: Arc<Trace>, inner: Arc<dyn QuicDialer>) -> Self {
        Self { trace, inner }
    }
}

#[async_trait]
impl QuicDialer for TracedQuicDialer {
    async fn dial(
        &self,
        ctx: &Context,
        address: &str,
        config: &TlsConfig,
        _trace: Option<&Trace>,
    ) -> io::Result<(Box<dyn QuicConn>, TlsConnectionState)> {
        let trace = &*self.trace;
        let started = trace.time_since_zero();
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            started,
            "quic_handshake_start",
            trace.tags(),
        ));

        let result = ctx
            .guard(self.inner.dial(ctx, address, config, Some(trace)))
            .await;

        let finished = trace.time_since_zero();
        let err = result
            .as_ref()
            .err()
            .map(|e| new_net_error(Operation::QuicHandshake, classify_quic_handshake_error, e));
        let state = result.as_ref().ok().map(|(_, state)| state);
        trace.push_quic_handshake(new_tls_or_quic_handshake_result(
            trace.index(),
            started,
            "udp",
            address,
            config,
            state,
            err.as_ref(),
            finished,
            trace.tags(),
        ));
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            finished,
            "quic_handshake_done",
            trace.tags(),
        ));

        result
    }
}
