//! Cancellation and deadlines
//!
//! A [`Context`] governs a group of operations. Cancelling it, or reaching
//! its deadline, makes every operation guarded by it (or by a context derived
//! from it) return promptly with a classified failure.

use crate::failure::{NetError, Operation, GENERIC_TIMEOUT_ERROR, INTERRUPTED};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context expiring after `timeout`.
    ///
    /// The earlier of the two deadlines wins. Cancelling the parent cancels
    /// the child; cancelling the child leaves the parent alone.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Derive a child context that can be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`Context::cancel`] was called on this context or a parent
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut` until it completes, the context is cancelled, or the
    /// deadline expires, whichever happens first.
    pub async fn guard<T, F>(&self, fut: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(interrupted());
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(interrupted()),
            () = expired => Err(timed_out()),
            res = fut => res,
        }
    }
}

fn interrupted() -> io::Error {
    NetError::new(Operation::TopLevel, INTERRUPTED).into_io()
}

fn timed_out() -> io::Error {
    NetError::new(Operation::TopLevel, GENERIC_TIMEOUT_ERROR).into_io()
}
