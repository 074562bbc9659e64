//! Optimistic transaction runner.
//!
//! Each attempt opens a fresh watched scope and hands it to a unit of work.
//! Conflicts are retried from the top, up to the configured bound; any other
//! error aborts the loop immediately.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{Store, Transaction};
use crate::error::{Result, WindowError};

/// Deadline and cancellation supplied by the caller of a counter operation.
///
/// Every store call made on behalf of the operation is raced against both, so
/// a cancellation in the middle of a retry loop stops it promptly.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`CallContext`] cloned from the one that created it.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CallContext {
    /// A context with no deadline that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Expire the context `timeout` from now.
    ///
    /// A timeout too large for the clock leaves the context as it was.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach a cancellation signal, returning the handle that fires it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle(tx))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Drive `fut` unless the context is cancelled or its deadline passes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline;
        let mut cancel = self.cancel.clone();

        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async move {
            match cancel.as_mut() {
                Some(rx) => {
                    // A dropped handle can no longer cancel anything.
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(WindowError::Cancelled),
            _ = expired => Err(WindowError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// One attempt of a protocol step against a watched key.
///
/// Returning [`WindowError::OptimisticConflict`] asks the runner to retry;
/// returning any other error aborts the whole retry loop.
#[async_trait]
pub trait UnitOfWork<T: Transaction>: Send + Sync {
    type Output: Send;

    async fn attempt(&self, tx: &mut T) -> Result<Self::Output>;
}

/// Runs units of work under optimistic concurrency with bounded retry.
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    max_retry: NonZeroU32,
    jitter: Duration,
}

impl TransactionRunner {
    /// Create a runner that retries immediately.
    pub fn new(max_retry: NonZeroU32) -> Self {
        Self {
            max_retry,
            jitter: Duration::ZERO,
        }
    }

    /// Sleep a random duration in `[0, jitter]` between conflicting attempts.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry.get()
    }

    /// Run `work` against `key`, retrying on conflict.
    pub async fn run<S, W>(
        &self,
        ctx: &CallContext,
        store: &S,
        key: &str,
        work: &W,
    ) -> Result<W::Output>
    where
        S: Store,
        W: UnitOfWork<S::Transaction>,
    {
        let attempts = self.max_retry.get();

        for attempt in 1..=attempts {
            trace!(key = %key, attempt = attempt, "Starting transaction attempt");

            let outcome = ctx
                .run(async {
                    let mut tx = store.watch(key).await?;
                    work.attempt(&mut tx).await
                })
                .await;

            match outcome {
                Ok(output) => return Ok(output),
                Err(err) if err.is_conflict() => {
                    debug!(
                        key = %key,
                        attempt = attempt,
                        max_retry = attempts,
                        "Watched key changed during transaction"
                    );
                    if attempt < attempts {
                        self.pause(ctx).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(WindowError::RetryExhausted { attempts })
    }

    async fn pause(&self, ctx: &CallContext) -> Result<()> {
        if self.jitter.is_zero() {
            return Ok(());
        }

        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max));
        ctx.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}
