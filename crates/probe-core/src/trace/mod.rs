//! Per-operation event collection
//!
//! A [`Trace`] collects the archival records produced while performing one
//! atomic network operation (one connect attempt, one lookup, one
//! handshake). Primitives are wrapped in trace-aware decorators which push
//! records onto bounded queues with a non-blocking try-push: when a queue
//! is full the record is dropped and the operation proceeds unaffected.
//!
//! The owner drains the queues once the operation is over. Records left in
//! the queues when the trace is dropped are lost.

mod conn;
mod dialer;
mod quic;
mod resolver;
mod tls;

pub use conn::TracedConn;
pub use dialer::TracedDialer;
pub use quic::TracedQuicDialer;
pub use resolver::TracedResolver;
pub use tls::TracedTlsHandshaker;

use crate::archival::{
    ArchivalDnsLookupResult, ArchivalNetworkEvent, ArchivalTcpConnectResult,
    ArchivalTlsOrQuicHandshakeResult, BYTES_RECEIVED_CUMULATIVE_OPERATION,
};
use crate::config::TraceConfig;
use crate::netx::{BoxConn, MeasuringNetwork};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Bytes received per `(network, address)`
type ReadSummary = HashMap<(String, String), i64>;

/// Event collector for one network operation.
pub struct Trace {
    index: i64,
    zero_time: Instant,
    tags: Vec<String>,
    network_events: ArrayQueue<ArchivalNetworkEvent>,
    dns_lookups: ArrayQueue<ArchivalDnsLookupResult>,
    tcp_connects: ArrayQueue<ArchivalTcpConnectResult>,
    tls_handshakes: ArrayQueue<ArchivalTlsOrQuicHandshakeResult>,
    quic_handshakes: ArrayQueue<ArchivalTlsOrQuicHandshakeResult>,
    dropped: AtomicU64,
    read_summary: Mutex<ReadSummary>,
}

fn try_push<T>(queue: &ArrayQueue<T>, dropped: &AtomicU64, kind: &str, index: i64, value: T) {
    if queue.push(value).is_err() {
        dropped.fetch_add(1, Ordering::Relaxed);
        trace!("[#{index}] trace queue full, dropping {kind} record");
    }
}

fn drain<T>(queue: &ArrayQueue<T>) -> Vec<T> {
    std::iter::from_fn(|| queue.pop()).collect()
}

impl Trace {
    /// Create a trace with the default queue capacities
    pub fn new(index: i64, zero_time: Instant, tags: Vec<String>) -> Self {
        Self::with_config(index, zero_time, tags, &TraceConfig::default())
    }

    /// Create a trace with explicit queue capacities. Zero capacities are
    /// raised to one.
    pub fn with_config(index: i64, zero_time: Instant, tags: Vec<String>, config: &TraceConfig) -> Self {
        Self {
            index,
            zero_time,
            tags,
            network_events: ArrayQueue::new(config.network_events.max(1)),
            dns_lookups: ArrayQueue::new(config.dns_lookups.max(1)),
            tcp_connects: ArrayQueue::new(config.tcp_connects.max(1)),
            tls_handshakes: ArrayQueue::new(config.tls_handshakes.max(1)),
            quic_handshakes: ArrayQueue::new(config.quic_handshakes.max(1)),
            dropped: AtomicU64::new(0),
            read_summary: Mutex::new(HashMap::new()),
        }
    }

    /// Unique index copied into every record as `transaction_id`
    pub fn index(&self) -> i64 {
        self.index
    }

    /// Reference instant of the whole measurement
    pub fn zero_time(&self) -> Instant {
        self.zero_time
    }

    /// Tags copied onto every record
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Time elapsed since the zero time
    pub fn time_since_zero(&self) -> Duration {
        self.zero_time.elapsed()
    }

    /// Records dropped because a queue was full
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ============ Emit ============

    /// Offer a network event
    pub fn push_network_event(&self, ev: ArchivalNetworkEvent) {
        try_push(&self.network_events, &self.dropped, "network event", self.index, ev);
    }

    /// Offer a DNS lookup result
    pub fn push_dns_lookup(&self, ev: ArchivalDnsLookupResult) {
        try_push(&self.dns_lookups, &self.dropped, "dns lookup", self.index, ev);
    }

    /// Offer a TCP connect result
    pub fn push_tcp_connect(&self, ev: ArchivalTcpConnectResult) {
        try_push(&self.tcp_connects, &self.dropped, "tcp connect", self.index, ev);
    }

    /// Offer a TLS handshake result
    pub fn push_tls_handshake(&self, ev: ArchivalTlsOrQuicHandshakeResult) {
        try_push(&self.tls_handshakes, &self.dropped, "tls handshake", self.index, ev);
    }

    /// Offer a QUIC handshake result
    pub fn push_quic_handshake(&self, ev: ArchivalTlsOrQuicHandshakeResult) {
        try_push(&self.quic_handshakes, &self.dropped, "quic handshake", self.index, ev);
    }

    // ============ Drain ============

    /// Pop every buffered network event, oldest first
    pub fn drain_network_events(&self) -> Vec<ArchivalNetworkEvent> {
        drain(&self.network_events)
    }

    /// Pop every buffered DNS lookup result, oldest first
    pub fn drain_dns_lookups(&self) -> Vec<ArchivalDnsLookupResult> {
        drain(&self.dns_lookups)
    }

    /// Pop every buffered TCP connect result, oldest first
    pub fn drain_tcp_connects(&self) -> Vec<ArchivalTcpConnectResult> {
        drain(&self.tcp_connects)
    }

    /// Pop every buffered TLS handshake result, oldest first
    pub fn drain_tls_handshakes(&self) -> Vec<ArchivalTlsOrQuicHandshakeResult> {
        drain(&self.tls_handshakes)
    }

    /// Pop every buffered QUIC handshake result, oldest first
    pub fn drain_quic_handshakes(&self) -> Vec<ArchivalTlsOrQuicHandshakeResult> {
        drain(&self.quic_handshakes)
    }

    // ============ Read summary ============

    /// Account for `count` bytes received from `address` over `network`.
    ///
    /// Only `tcp` and `udp` are tracked.
    pub fn update_read_summary(&self, network: &str, address: &str, count: usize) {
        if count == 0 || !matches!(network, "tcp" | "udp") {
            return;
        }
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut summary = self.read_summary.lock();
        let entry = summary
            .entry((network.to_string(), address.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(count);
    }

    /// Turn the read summary into one event per `(network, address)` and
    /// clear it, so the next call only sees what arrived in between.
    pub fn sample_read_summary(&self) -> Vec<ArchivalNetworkEvent> {
        let elapsed = self.time_since_zero().as_secs_f64();
        let summary = std::mem::take(&mut *self.read_summary.lock());
        let mut out: Vec<ArchivalNetworkEvent> = summary
            .into_iter()
            .map(|((network, address), bytes)| ArchivalNetworkEvent {
                address,
                failure: None,
                num_bytes: bytes,
                operation: BYTES_RECEIVED_CUMULATIVE_OPERATION.to_string(),
                proto: network,
                t0: elapsed,
                t: elapsed,
                transaction_id: self.index,
                tags: self.tags.clone(),
            })
            .collect();
        out.sort_by(|a, b| (&a.proto, &a.address).cmp(&(&b.proto, &b.address)));
        out
    }

    // ============ Wrappers ============

    /// Wrap a resolver so it reports to this trace
    pub fn wrap_resolver(self: &Arc<Self>, inner: Arc<dyn crate::netx::Resolver>) -> TracedResolver {
        TracedResolver::new(Arc::clone(self), inner)
    }

    /// Wrap a dialer so it reports to this trace
    pub fn wrap_dialer(self: &Arc<Self>, inner: Arc<dyn crate::netx::Dialer>) -> TracedDialer {
        TracedDialer::new(Arc::clone(self), inner)
    }

    /// Wrap a TLS handshaker so it reports to this trace
    pub fn wrap_tls_handshaker(
        self: &Arc<Self>,
        inner: Arc<dyn crate::netx::TlsHandshaker>,
    ) -> TracedTlsHandshaker {
        TracedTlsHandshaker::new(Arc::clone(self), inner)
    }

    /// Wrap a QUIC dialer so it reports to this trace
    pub fn wrap_quic_dialer(self: &Arc<Self>, inner: Arc<dyn crate::netx::QuicDialer>) -> TracedQuicDialer {
        TracedQuicDialer::new(Arc::clone(self), inner)
    }

    /// Wrap a connection so its reads and writes report to this trace
    pub fn wrap_conn(self: &Arc<Self>, conn: BoxConn) -> TracedConn {
        TracedConn::new(Arc::clone(self), conn)
    }

    /// Trace-aware system resolver
    pub fn new_stdlib_resolver(self: &Arc<Self>, network: &dyn MeasuringNetwork) -> TracedResolver {
        self.wrap_resolver(network.new_stdlib_resolver())
    }

    /// Trace-aware DNS-over-UDP resolver
    pub fn new_parallel_udp_resolver(
        self: &Arc<Self>,
        network: &dyn MeasuringNetwork,
        address: &str,
    ) -> TracedResolver {
        self.wrap_resolver(network.new_udp_resolver(address))
    }

    /// Trace-aware dialer that does not resolve names
    pub fn new_dialer_without_resolver(self: &Arc<Self>, network: &dyn MeasuringNetwork) -> TracedDialer {
        self.wrap_dialer(network.new_dialer())
    }

    /// Trace-aware TLS handshaker
    pub fn new_tls_handshaker(self: &Arc<Self>, network: &dyn MeasuringNetwork) -> TracedTlsHandshaker {
        self.wrap_tls_handshaker(network.new_tls_handshaker())
    }

    /// Trace-aware QUIC dialer
    pub fn new_quic_dialer(self: &Arc<Self>, network: &dyn MeasuringNetwork) -> TracedQuicDialer {
        self.wrap_quic_dialer(network.new_quic_dialer())
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("index", &self.index)
            .field("tags", &self.tags)
            .field("dropped", &self.dropped_records())
            .finish_non_exhaustive()
    }
}
