//! Observations collected by pipeline steps

use crate::archival::{
    ArchivalDnsLookupResult, ArchivalHttpRequestResult, ArchivalNetworkEvent, ArchivalTcpConnectResult,
    ArchivalTlsOrQuicHandshakeResult,
};
use crate::trace::Trace;
use serde::{Deserialize, Serialize};

/// Archival records produced by one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    /// I/O events and annotations
    pub network_events: Vec<ArchivalNetworkEvent>,
    /// DNS lookups
    pub queries: Vec<ArchivalDnsLookupResult>,
    /// TCP connects
    pub tcp_connect: Vec<ArchivalTcpConnectResult>,
    /// TLS handshakes
    pub tls_handshakes: Vec<ArchivalTlsOrQuicHandshakeResult>,
    /// QUIC handshakes
    pub quic_handshakes: Vec<ArchivalTlsOrQuicHandshakeResult>,
    /// HTTP transactions
    pub requests: Vec<ArchivalHttpRequestResult>,
}

impl Observations {
    /// Drain every queue of `trace`
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            network_events: trace.drain_network_events(),
            queries: trace.drain_dns_lookups(),
            tcp_connect: trace.drain_tcp_connects(),
            tls_handshakes: trace.drain_tls_handshakes(),
            quic_handshakes: trace.drain_quic_handshakes(),
            requests: Vec::new(),
        }
    }

    /// Whether there is no record at all
    pub fn is_empty(&self) -> bool {
        self.network_events.is_empty()
            && self.queries.is_empty()
            && self.tcp_connect.is_empty()
            && self.tls_handshakes.is_empty()
            && self.quic_handshakes.is_empty()
            && self.requests.is_empty()
    }
}

/// Observations of `trace`, as a one-element list
pub fn maybe_trace_to_observations(trace: Option<&Trace>) -> Vec<Observations> {
    trace.map(Observations::from_trace).into_iter().collect()
}
