use super::Trace;
use crate::archival::{new_network_event, new_tcp_connect_result};
use crate::failure::{classify_generic_error, new_net_error, Operation};
use crate::netx::{BoxConn, Context, Dialer};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Dialer reporting every connect attempt to its [`Trace`]. Connections it
/// returns report their reads and writes too.
pub struct TracedDialer {
    trace: Arc<Trace>,
    inner: Arc<dyn Dialer>,
}

impl TracedDialer {
    pub(super) fn new(trace: Arc<Trace>, inner: Arc<dyn Dialer>) -> Self {
        Self { trace, inner }
    }
}

#[async_trait]
impl Dialer for TracedDialer {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
        _trace: Option<&Trace>,
    ) -> io::Result<BoxConn> {
        let trace = &*self.trace;
        let started = trace.time_since_zero();

        let result = ctx
            .guard(self.inner.dial(ctx, network, address, Some(trace)))
            .await;

        let finished = trace.time_since_zero();
        let err = result
            .as_ref()
            .err()
            .map(|e| new_net_error(Operation::Connect, classify_generic_error, e));
        trace.push_network_event(new_network_event(
            trace.index(),
            started,
            Operation::Connect.as_str(),
            network,
            address,
            0,
            err.as_ref(),
            finished,
            trace.tags(),
        ));
        if network == "tcp" {
            trace.push_tcp_connect(new_tcp_connect_result(
                trace.index(),
                started,
                address,
                err.as_ref(),
                finished,
                trace.tags(),
            ));
        }

        result.map(|conn| Box::new(self.trace.wrap_conn(conn)) as BoxConn)
    }
}
