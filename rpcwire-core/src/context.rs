//! Deadlines and cancellation for a single call.

use std::future::Future;
use std::time::Duration;

use futures::future::{self, FutureExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Error;

/// Deadline and cancellation signals of one call.
///
/// Cloning shares the signals. A context derived with [`with_cancel`]
/// is canceled when its own handle or any parent handle fires.
///
/// [`with_cancel`]: CallContext::with_cancel
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Vec<watch::Receiver<bool>>,
}

/// Cancels the contexts derived from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorten the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Shorten the deadline. A later deadline than the current one is ignored.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel.push(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The terminal error if the call is already canceled or expired.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.iter().any(|rx| *rx.borrow()) {
            return Some(Error::canceled("context canceled"));
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                Some(Error::deadline_exceeded("context deadline exceeded"))
            }
            _ => None,
        }
    }

    /// Resolves once the call is canceled or its deadline passes.
    pub async fn done(&self) -> Error {
        let canceled = async {
            if self.cancel.is_empty() {
                return future::pending::<()>().await;
            }
            let waits = self.cancel.iter().cloned().map(|mut rx| {
                async move {
                    // A dropped handle can no longer cancel.
                    let closed = rx.wait_for(|canceled| *canceled).await.is_err();
                    if closed {
                        future::pending::<()>().await;
                    }
                }
                .boxed()
            });
            future::select_all(waits).await;
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = canceled => Error::canceled("context canceled"),
            _ = expired => Error::deadline_exceeded("context deadline exceeded"),
        }
    }

    /// Drive `fut` unless the call ends first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            result = fut => result,
            err = self.done() => Err(err),
        }
    }
}
