//! DNS lookup steps

use super::fxcore::{operation, Maybe, Step, StepFunc};
use super::observations::maybe_trace_to_observations;
use super::runtime::Runtime;
use crate::failure::{classify_resolver_error, new_net_error, NetError, Operation, DNS_NO_ANSWER};
use crate::netx::{Context, Resolver};
use crate::trace::Trace;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Input of the lookup steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainToResolve {
    /// Domain to resolve
    pub domain: String,
    /// Tags for the lookup trace
    pub tags: Vec<String>,
}

impl DomainToResolve {
    /// Resolve `domain` without tags
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tags: Vec::new(),
        }
    }

    /// Set the tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Output of the lookup steps.
#[derive(Debug, Clone)]
pub struct ResolvedAddresses {
    /// Resolved IP addresses
    pub addresses: Vec<String>,
    /// Domain that was resolved
    pub domain: String,
    /// Trace of the lookup
    pub trace: Arc<Trace>,
}

async fn lookup(
    rt: &Runtime,
    ctx: &Context,
    trace: Arc<Trace>,
    resolver: &dyn Resolver,
    domain: String,
) -> Maybe<ResolvedAddresses> {
    let label = format!("[#{}] DNSLookup[{}] {domain}", trace.index(), resolver.network());
    debug!("{label}");

    let ctx = ctx.with_timeout(rt.config().timeouts.dns());
    let result = resolver.lookup_host(&ctx, &domain, Some(&*trace)).await;
    let observations = maybe_trace_to_observations(Some(&*trace));

    let result = match result {
        Ok(addresses) => {
            debug!("{label}... {addresses:?}");
            Ok(ResolvedAddresses {
                addresses,
                domain,
                trace,
            })
        }
        Err(e) => {
            let err = new_net_error(Operation::Resolve, classify_resolver_error, &e);
            debug!("{label}... {err}");
            Err(err)
        }
    };
    Maybe::new(result, observations)
}

/// [`Step`] behind [`dns_lookup_getaddrinfo`]
#[derive(Debug)]
pub struct DnsLookupGetaddrinfo {
    rt: Arc<Runtime>,
}

/// Resolve with the system resolver
pub fn dns_lookup_getaddrinfo(rt: &Arc<Runtime>) -> StepFunc<DnsLookupGetaddrinfo> {
    operation(DnsLookupGetaddrinfo { rt: Arc::clone(rt) })
}

#[async_trait]
impl Step<DomainToResolve, ResolvedAddresses> for DnsLookupGetaddrinfo {
    #[instrument(skip_all, fields(domain = %input.domain))]
    async fn run(&self, ctx: &Context, input: DomainToResolve) -> Maybe<ResolvedAddresses> {
        let trace = self.rt.new_trace(input.tags);
        let resolver = trace.new_stdlib_resolver(self.rt.network());
        lookup(&self.rt, ctx, trace, &resolver, input.domain).await
    }
}

/// [`Step`] behind [`dns_lookup_udp`]
#[derive(Debug)]
pub struct DnsLookupUdp {
    rt: Arc<Runtime>,
    resolver_address: String,
}

/// Resolve by sending A and AAAA queries to `resolver_address` over UDP
pub fn dns_lookup_udp(rt: &Arc<Runtime>, resolver_address: impl Into<String>) -> StepFunc<DnsLookupUdp> {
    operation(DnsLookupUdp {
        rt: Arc::clone(rt),
        resolver_address: resolver_address.into(),
    })
}

#[async_trait]
impl Step<DomainToResolve, ResolvedAddresses> for DnsLookupUdp {
    #[instrument(skip_all, fields(domain = %input.domain, resolver = %self.resolver_address))]
    async fn run(&self, ctx: &Context, input: DomainToResolve) -> Maybe<ResolvedAddresses> {
        let trace = self.rt.new_trace(input.tags);
        let resolver = trace.new_parallel_udp_resolver(self.rt.network(), &self.resolver_address);
        lookup(&self.rt, ctx, trace, &resolver, input.domain).await
    }
}

/// Merge lookups of the same domain made with different resolvers.
///
/// Succeeds if any lookup succeeded, with the union of the addresses in
/// first-seen order. Otherwise fails with the first failure. Observations
/// of every lookup are kept, in order.
pub fn merge_resolved_addresses(results: Vec<Maybe<ResolvedAddresses>>) -> Maybe<ResolvedAddresses> {
    let mut observations = Vec::new();
    let mut merged: Option<ResolvedAddresses> = None;
    let mut first_error: Option<NetError> = None;

    for Maybe {
        result,
        observations: mut obs,
    } in results
    {
        observations.append(&mut obs);
        match (result, &mut merged) {
            (Ok(resolved), None) => {
                let mut resolved = resolved;
                let mut seen = Vec::with_capacity(resolved.addresses.len());
                for addr in std::mem::take(&mut resolved.addresses) {
                    if !seen.contains(&addr) {
                        seen.push(addr);
                    }
                }
                resolved.addresses = seen;
                merged = Some(resolved);
            }
            (Ok(resolved), Some(into)) => {
                for addr in resolved.addresses {
                    if !into.addresses.contains(&addr) {
                        into.addresses.push(addr);
                    }
                }
            }
            (Err(err), _) => {
                first_error.get_or_insert(err);
            }
        }
    }

    let result = match merged {
        Some(resolved) => Ok(resolved),
        None => Err(first_error.unwrap_or_else(|| NetError::new(Operation::Resolve, DNS_NO_ANSWER))),
    };
    Maybe::new(result, observations)
}
