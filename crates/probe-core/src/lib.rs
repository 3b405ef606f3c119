//! # netprobe core
//!
//! Building blocks for measuring network interference.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Archival records** - The data format every observation is saved in
//! - **Failure classification** - Canonical strings for network errors
//! - **Traces** - Decorators recording what DNS, TCP, TLS and QUIC primitives did
//! - **Pipelines** - Composable measurement steps carrying their observations
//! - **Throughput sampling** - Memoryless snapshots of bytes received
//!
//! ## Example
//!
//! ```rust,no_run
//! use probe_core::dslx::{
//!     dns_lookup_getaddrinfo, dns_lookup_udp, merge_resolved_addresses, parallel, AddressSet, Context,
//!     DomainToResolve, Func, Runtime,
//! };
//! use probe_core::netx::SystemNetwork;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let rt = Arc::new(Runtime::new(Arc::new(SystemNetwork::new())));
//! let lookups: Vec<Arc<dyn Func<DomainToResolve, _>>> = vec![
//!     Arc::new(dns_lookup_getaddrinfo(&rt)),
//!     Arc::new(dns_lookup_udp(&rt, "8.8.8.8:53")),
//! ];
//! let results = parallel(&Context::new(), 2, DomainToResolve::new("dns.google"), lookups).await;
//! let merged = merge_resolved_addresses(results);
//! let addresses = AddressSet::new([&merged]);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archival;
pub mod config;
pub mod dslx;
pub mod error;
pub mod failure;
pub mod memoryless;
pub mod netx;
pub mod speed;
pub mod trace;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use failure::{NetError, Operation};
pub use netx::{Context, MeasuringNetwork, Netem, SystemNetwork};
pub use speed::SpeedCollector;
pub use trace::Trace;
