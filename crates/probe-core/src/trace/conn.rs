use super::Trace;
use crate::archival::new_network_event;
use crate::failure::{classify_generic_error, new_net_error, NetError, Operation, EOF_ERROR};
use crate::netx::{BoxConn, Conn};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Connection reporting every completed read and write to its [`Trace`]
/// and feeding the trace's read summary.
pub struct TracedConn {
    trace: Arc<Trace>,
    inner: BoxConn,
    network: &'static str,
    address: String,
    read_started: Option<Duration>,
    write_started: Option<Duration>,
}

impl TracedConn {
    pub(super) fn new(trace: Arc<Trace>, inner: BoxConn) -> Self {
        let network = inner.network();
        let address = inner
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Self {
            trace,
            inner,
            network,
            address,
            read_started: None,
            write_started: None,
        }
    }

    fn record(&self, operation: Operation, started: Duration, count: usize, err: Option<&NetError>) {
        let trace = &*self.trace;
        trace.push_network_event(new_network_event(
            trace.index(),
            started,
            operation.as_str(),
            self.network,
            &self.address,
            count,
            err,
            trace.time_since_zero(),
            trace.tags(),
        ));
    }
}

impl AsyncRead for TracedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_started.is_none() {
            this.read_started = Some(this.trace.time_since_zero());
        }

        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(res) = &poll {
            let started = this.read_started.take().unwrap_or_default();
            let count = buf.filled().len() - before;
            let err = match res {
                Err(e) => Some(new_net_error(Operation::Read, classify_generic_error, e)),
                Ok(()) if count == 0 && buf.remaining() > 0 => {
                    Some(NetError::new(Operation::Read, EOF_ERROR))
                }
                Ok(()) => None,
            };
            this.record(Operation::Read, started, count, err.as_ref());
            if err.is_none() {
                this.trace.update_read_summary(this.network, &this.address, count);
            }
        }
        poll
    }
}

impl AsyncWrite for TracedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_started.is_none() {
            this.write_started = Some(this.trace.time_since_zero());
        }

        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(res) = &poll {
            let started = this.write_started.take().unwrap_or_default();
            match res {
                Ok(count) => this.record(Operation::Write, started, *count, None),
                Err(e) => {
                    let err = new_net_error(Operation::Write, classify_generic_error, e);
                    this.record(Operation::Write, started, 0, Some(&err));
                }
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for TracedConn {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn network(&self) -> &'static str {
        self.network
    }
}
