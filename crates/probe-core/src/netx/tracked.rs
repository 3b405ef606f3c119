//! Shared connection slots

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Slot<C> {
    conn: Mutex<Option<C>>,
    closed: AtomicBool,
    on_close: CancellationToken,
}

/// A connection shared between the pipeline step using it and the pool
/// that closes it at the end of the run.
///
/// Users [`take`](Self::take) the connection for the duration of an
/// operation and [`restore`](Self::restore) it afterwards. Once the slot is
/// closed, restored connections are dropped immediately.
pub struct TrackedConn<C> {
    slot: Arc<Slot<C>>,
}

impl<C> Clone for TrackedConn<C> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> TrackedConn<C> {
    /// Wrap a connection
    pub fn new(conn: C) -> Self {
        Self {
            slot: Arc::new(Slot {
                conn: Mutex::new(Some(conn)),
                closed: AtomicBool::new(false),
                on_close: CancellationToken::new(),
            }),
        }
    }

    /// Move the connection out, leaving the slot empty
    pub fn take(&self) -> Option<C> {
        self.slot.conn.lock().take()
    }

    /// Put a connection back. Dropped right away if the slot was closed.
    pub fn restore(&self, conn: C) {
        let mut guard = self.slot.conn.lock();
        if self.slot.closed.load(Ordering::Acquire) {
            drop(guard);
            drop(conn);
            return;
        }
        *guard = Some(conn);
    }

    /// Inspect the connection without moving it
    pub fn with<R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        self.slot.conn.lock().as_ref().map(f)
    }

    /// Use the connection in place. The slot stays locked while `f` runs,
    /// so `f` must not block.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.slot.conn.lock().as_mut().map(f)
    }

    /// Token cancelled once [`close`](Self::close) runs
    pub fn close_token(&self) -> CancellationToken {
        self.slot.on_close.clone()
    }

    /// Drop the connection and refuse any later restore.
    ///
    /// Returns whether this call did the closing.
    pub fn close(&self) -> bool {
        let conn = {
            let mut guard = self.slot.conn.lock();
            if self.slot.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            guard.take()
        };
        drop(conn);
        self.slot.on_close.cancel();
        true
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }

    /// Whether the connection is currently in the slot
    pub fn is_present(&self) -> bool {
        self.slot.conn.lock().is_some()
    }
}

impl<C> std::fmt::Debug for TrackedConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConn")
            .field("present", &self.is_present())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(Arc<AtomicBool>);

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_and_restore() {
        let conn = TrackedConn::new(5_u32);
        assert_eq!(conn.take(), Some(5));
        assert!(!conn.is_present());
        conn.restore(6);
        assert_eq!(conn.with(|c| *c), Some(6));
    }

    #[test]
    fn test_close_drops_once() {
        let dropped = Arc::new(AtomicBool::new(false));
        let conn = TrackedConn::new(Probe(Arc::clone(&dropped)));
        assert!(conn.close());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!conn.close());
    }

    #[test]
    fn test_with_mut_and_close_token() {
        let conn = TrackedConn::new(vec![1_u8]);
        let token = conn.close_token();
        let len = conn.with_mut(|v| {
            v.push(2);
            v.len()
        });
        assert_eq!(len, Some(2));
        assert!(!token.is_cancelled());

        conn.close();
        assert!(token.is_cancelled());
        assert_eq!(conn.with_mut(|v| v.len()), None);
    }

    #[test]
    fn test_restore_after_close_drops() {
        let dropped = Arc::new(AtomicBool::new(false));
        let conn = TrackedConn::new(Probe(Arc::clone(&dropped)));
        let taken = conn.take().unwrap();
        conn.close();
        assert!(!dropped.load(Ordering::SeqCst));
        conn.restore(taken);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!conn.is_present());
    }
}
