//! Per-run state shared by every step of a pipeline

use crate::config::Config;
use crate::netx::{MeasuringNetwork, TrackedConn};
use crate::trace::Trace;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Something the pool can close.
#[cfg_attr(test, mockall::automock)]
pub trait Closer: Send + Sync {
    /// Release the resource
    fn close(&self) -> io::Result<()>;
}

impl<C: Send> Closer for TrackedConn<C> {
    fn close(&self) -> io::Result<()> {
        TrackedConn::close(self);
        Ok(())
    }
}

#[derive(Default)]
struct PoolState {
    handles: Vec<Arc<dyn Closer>>,
    closed: bool,
}

/// Connections opened during one run, closed together at the end.
#[derive(Default)]
pub struct ConnPool {
    state: Mutex<PoolState>,
}

impl ConnPool {
    /// An empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`. A handle tracked after [`close`](Self::close)
    /// is closed right away.
    pub fn track(&self, handle: Option<Arc<dyn Closer>>) {
        let Some(handle) = handle else {
            return;
        };
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            if let Err(e) = handle.close() {
                debug!("ConnPool: late close failed: {e}");
            }
            return;
        }
        state.handles.push(handle);
    }

    /// Close every handle, most recent first. Only the first call does
    /// anything; close errors are ignored.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for handle in state.handles.iter().rev() {
            if let Err(e) = handle.close() {
                debug!("ConnPool: close failed: {e}");
            }
        }
        state.handles.clear();
    }

    /// Handles currently tracked
    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Whether no handle is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnPool")
            .field("handles", &state.handles.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// The network, trace numbering, zero time and connection pool of one
/// measurement run.
pub struct Runtime {
    network: Arc<dyn MeasuringNetwork>,
    pool: ConnPool,
    ids: AtomicI64,
    zero_time: Instant,
    config: Config,
}

impl Runtime {
    /// Runtime with the default configuration
    pub fn new(network: Arc<dyn MeasuringNetwork>) -> Self {
        Self::with_config(network, Config::default())
    }

    /// Runtime with an explicit configuration
    pub fn with_config(network: Arc<dyn MeasuringNetwork>, config: Config) -> Self {
        Self {
            network,
            pool: ConnPool::new(),
            ids: AtomicI64::new(0),
            zero_time: Instant::now(),
            config,
        }
    }

    /// The network primitives come from here
    pub fn network(&self) -> &dyn MeasuringNetwork {
        &*self.network
    }

    /// Configuration of this run
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reference instant of every timestamp
    pub fn zero_time(&self) -> Instant {
        self.zero_time
    }

    /// A trace with the next index (the first one is 1)
    pub fn new_trace(&self, tags: Vec<String>) -> Arc<Trace> {
        let index = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Trace::with_config(index, self.zero_time, tags, &self.config.trace))
    }

    /// Close `handle` when the run ends
    pub fn track(&self, handle: Option<Arc<dyn Closer>>) {
        self.pool.track(handle);
    }

    /// Close every tracked connection. Idempotent.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.pool)
            .field("traces", &self.ids.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netx::Netem;
    use mockall::Sequence;

    fn closer(seq: &mut Sequence, result: io::Result<()>) -> Arc<dyn Closer> {
        let mut mock = MockCloser::new();
        let mut result = Some(result);
        mock.expect_close()
            .times(1)
            .in_sequence(seq)
            .returning(move || result.take().unwrap_or(Ok(())));
        Arc::new(mock)
    }

    // =========== ConnPool Tests ===========

    #[test]
    fn test_close_lifo_once() {
        let mut seq = Sequence::new();
        let pool = ConnPool::new();
        let handles: Vec<_> = (0..3).map(|_| closer(&mut seq, Ok(()))).collect();
        // expectations are ordered by creation, so track in reverse
        for handle in handles.into_iter().rev() {
            pool.track(Some(handle));
        }
        assert_eq!(pool.len(), 3);

        pool.close();
        pool.close();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_close_ignores_errors() {
        let mut seq = Sequence::new();
        let pool = ConnPool::new();
        let second = closer(&mut seq, Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        let first = closer(&mut seq, Ok(()));
        pool.track(Some(first));
        pool.track(Some(second));
        pool.close();
    }

    #[test]
    fn test_track_none_and_after_close() {
        let pool = ConnPool::new();
        pool.track(None);
        assert!(pool.is_empty());
        pool.close();

        let mut seq = Sequence::new();
        pool.track(Some(closer(&mut seq, Ok(()))));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_tracked_conn_closer() {
        let conn = TrackedConn::new(42u8);
        let pool = ConnPool::new();
        pool.track(Some(Arc::new(conn.clone())));
        drop(pool);
        assert!(conn.is_closed());
        assert!(!conn.is_present());
    }

    // =========== Runtime Tests ===========

    #[test]
    fn test_trace_indexes() {
        let rt = Runtime::new(Arc::new(Netem::new()));
        let first = rt.new_trace(vec!["a".to_string()]);
        let second = rt.new_trace(Vec::new());
        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 2);
        assert_eq!(first.tags(), ["a".to_string()]);
        assert_eq!(first.zero_time(), rt.zero_time());
    }

    #[test]
    fn test_runtime_close_is_idempotent() {
        let rt = Runtime::new(Arc::new(Netem::new()));
        let conn = TrackedConn::new(());
        rt.track(Some(Arc::new(conn.clone())));
        rt.close();
        rt.close();
        assert!(conn.is_closed());
    }
}
