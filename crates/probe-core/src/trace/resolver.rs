use super::Trace;
use crate::archival::{new_annotation_network_event, new_dns_lookup_result};
use crate::failure::{classify_resolver_error, new_net_error, Operation};
use crate::netx::{Context, Resolver};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Resolver reporting every lookup to its [`Trace`].
pub struct TracedResolver {
    trace: Arc<Trace>,
    inner: Arc<dyn Resolver>,
}

impl TracedResolver {
    pub(super) fn new(trace: Arc<Trace>, inner: Arc<dyn Resolver>) -> Self {
        Self { trace, inner }
    }
}

#[async_trait]
impl Resolver for TracedResolver {
    async fn lookup_host(
        &self,
        ctx: &Context,
        domain: &str,
        _trace: Option<&Trace>,
    ) -> io::Result<Vec<String>> {
        let trace = &*self.trace;
        let started = trace.time_since_zero();
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            started,
            "resolve_start",
            trace.tags(),
        ));

        let result = ctx
            .guard(self.inner.lookup_host(ctx, domain, Some(trace)))
            .await;

        let finished = trace.time_since_zero();
        let err = result
            .as_ref()
            .err()
            .map(|e| new_net_error(Operation::Resolve, classify_resolver_error, e));
        let addrs: &[String] = result.as_deref().unwrap_or(&[]);
        trace.push_dns_lookup(new_dns_lookup_result(
            trace.index(),
            started,
            self.inner.network(),
            self.inner.address(),
            "ANY",
            domain,
            addrs,
            err.as_ref(),
            finished,
            trace.tags(),
        ));
        trace.push_network_event(new_annotation_network_event(
            trace.index(),
            finished,
            "resolve_done",
            trace.tags(),
        ));

        result
    }

    fn network(&self) -> &str {
        self.inner.network()
    }

    fn address(&self) -> &str {
        self.inner.address()
    }
}
