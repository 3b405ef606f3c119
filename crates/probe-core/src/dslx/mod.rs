//! Measurement pipelines
//!
//! A pipeline is a chain of steps. Each step is a [`Func`] from a
//! [`Maybe`] to a [`Maybe`]: it receives the result of the previous step,
//! performs one network operation through a fresh (or inherited)
//! [`Trace`](crate::trace::Trace), and returns the next state together
//! with the [`Observations`] drained from that trace.
//!
//! ```ignore
//! let rt = Arc::new(Runtime::new(Arc::new(SystemNetwork::new())));
//! let pipeline = compose!(
//!     tcp_connect(&rt),
//!     tls_handshake(&rt, TlsHandshakeOptions::default()),
//!     http_transport_tls(&rt),
//!     http_request(&rt, HttpRequestOptions::default()),
//! );
//! let result = pipeline.apply(&Context::new(), Maybe::ok(endpoint)).await;
//! rt.close();
//! ```
//!
//! Failures never abort a pipeline with an `Err` return: they travel
//! inside the [`Maybe`] and every later step passes them through.

pub mod address;
pub mod dns;
pub mod fxasync;
pub mod fxcore;
pub mod http;
pub mod observations;
pub mod quic;
pub mod runtime;
pub mod tcp;
pub mod tls;

pub use address::{ip_info_to_endpoints, new_ip_info, AddressSet, Endpoint, EndpointInfo, IpInfo, IpInfoFlags};
pub use dns::{
    dns_lookup_getaddrinfo, dns_lookup_udp, merge_resolved_addresses, DomainToResolve, ResolvedAddresses,
};
pub use fxasync::{apply_async, collect, map_parallel, parallel, stream_list};
pub use fxcore::{
    compose2, extract_observations, first_error, first_error_excluding_broken_ipv6, operation, record_errors,
    step_fn, Compose2, CountStep, Counter, ErrorLogger, FnStep, Func, Maybe, Step, StepFunc,
};
pub use http::{
    http_request, http_transport_tcp, http_transport_tls, HttpConnection, HttpExchange, HttpRequestOptions,
};
pub use observations::{maybe_trace_to_observations, Observations};
pub use quic::{quic_handshake, QuicConnection, QuicHandshakeOptions};
pub use runtime::{Closer, ConnPool, Runtime};
pub use tcp::{tcp_connect, TcpConnection};
pub use tls::{tls_handshake, TlsConnection, TlsHandshakeOptions};

pub use crate::netx::Context;
