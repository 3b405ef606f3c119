//! TCP connect step

use super::address::Endpoint;
use super::fxcore::{operation, Maybe, Step, StepFunc};
use super::observations::maybe_trace_to_observations;
use super::runtime::Runtime;
use crate::failure::{classify_generic_error, new_net_error, Operation};
use crate::netx::{BoxConn, Context, Dialer, TrackedConn};
use crate::trace::Trace;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// An established TCP connection.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    /// Remote `ip:port`
    pub address: String,
    /// The connection, also tracked by the runtime
    pub conn: TrackedConn<BoxConn>,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// Always `tcp`
    pub network: String,
    /// Trace of the connect, reused by the steps on top of it
    pub trace: Arc<Trace>,
}

/// [`Step`] behind [`tcp_connect`]
#[derive(Debug)]
pub struct TcpConnect {
    rt: Arc<Runtime>,
}

/// Connect to an endpoint
pub fn tcp_connect(rt: &Arc<Runtime>) -> StepFunc<TcpConnect> {
    operation(TcpConnect { rt: Arc::clone(rt) })
}

#[async_trait]
impl Step<Endpoint, TcpConnection> for TcpConnect {
    #[instrument(skip_all, fields(address = %input.address))]
    async fn run(&self, ctx: &Context, input: Endpoint) -> Maybe<TcpConnection> {
        let trace = self.rt.new_trace(input.tags);
        let dialer = trace.new_dialer_without_resolver(self.rt.network());
        let label = format!("[#{}] TCPConnect {}", trace.index(), input.address);
        debug!("{label}");

        let ctx = ctx.with_timeout(self.rt.config().timeouts.tcp_connect());
        let result = dialer.dial(&ctx, "tcp", &input.address, Some(&*trace)).await;
        let observations = maybe_trace_to_observations(Some(&*trace));

        let result = match result {
            Ok(conn) => {
                debug!("{label}... ok");
                let conn = TrackedConn::new(conn);
                self.rt.track(Some(Arc::new(conn.clone())));
                Ok(TcpConnection {
                    address: input.address,
                    conn,
                    domain: input.domain,
                    network: "tcp".to_string(),
                    trace,
                })
            }
            Err(e) => {
                let err = new_net_error(Operation::Connect, classify_generic_error, &e);
                debug!("{label}... {err}");
                Err(err)
            }
        };
        Maybe::new(result, observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dslx::fxcore::Func;
    use crate::failure::{NetError, CONNECTION_REFUSED, INTERRUPTED};
    use crate::netx::{DpiRule, Netem};

    fn netem() -> Netem {
        let netem = Netem::new();
        netem.add_http_server("93.184.216.34:80".parse().unwrap(), "HTTP/1.1 204 No Content\r\n\r\n");
        netem
    }

    fn endpoint(address: &str) -> Maybe<Endpoint> {
        Maybe::ok(
            Endpoint::new("tcp", address)
                .with_domain("example.com")
                .with_tags(vec!["tcp".to_string()]),
        )
    }

    #[tokio::test]
    async fn test_connect_success() {
        let rt = Arc::new(Runtime::new(Arc::new(netem())));
        let out = tcp_connect(&rt).apply(&Context::new(), endpoint("93.184.216.34:80")).await;

        let state = out.state().unwrap();
        assert_eq!(state.address, "93.184.216.34:80");
        assert_eq!(state.domain, "example.com");
        assert!(state.conn.is_present());

        let connects = &out.observations[0].tcp_connect;
        assert_eq!(connects.len(), 1);
        assert!(connects[0].status.success);
        assert_eq!(connects[0].ip, "93.184.216.34");
        assert_eq!(connects[0].port, 80);
        assert_eq!(connects[0].tags, vec!["tcp".to_string()]);

        rt.close();
        assert!(state.conn.is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let rt = Arc::new(Runtime::new(Arc::new(netem())));
        let out = tcp_connect(&rt).apply(&Context::new(), endpoint("93.184.216.34:81")).await;
        let err = out.error().unwrap();
        assert_eq!(err.failure, CONNECTION_REFUSED);
        assert_eq!(err.operation, Operation::Connect);
        let connects = &out.observations[0].tcp_connect;
        assert_eq!(connects[0].status.failure.as_deref(), Some(CONNECTION_REFUSED));
        assert!(!connects[0].status.success);
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let netem = netem();
        netem.add_dpi_rule(DpiRule::DropTrafficForServerEndpoint {
            endpoint: "93.184.216.34:80".to_string(),
        });
        let rt = Arc::new(Runtime::new(Arc::new(netem)));
        let ctx = Context::new();
        let pending = {
            let rt = Arc::clone(&rt);
            let ctx = ctx.clone();
            tokio::spawn(async move { tcp_connect(&rt).apply(&ctx, endpoint("93.184.216.34:80")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        ctx.cancel();

        let out = pending.await.unwrap();
        assert_eq!(out.error().map(|e| e.operation), Some(Operation::Connect));
        assert_eq!(out.error().map(NetError::failure), Some(INTERRUPTED));

        // archived like any other failure
        let connects = &out.observations[0].tcp_connect;
        assert_eq!(connects.len(), 1);
        assert!(!connects[0].status.success);
        assert_eq!(connects[0].status.failure.as_deref(), Some(INTERRUPTED));
        let connect_event = out.observations[0]
            .network_events
            .iter()
            .find(|e| e.operation == "connect")
            .unwrap();
        assert_eq!(connect_event.failure.as_deref(), Some(INTERRUPTED));
    }
}
