//! Window operations.
//!
//! Each operation performs a single read/modify/fix-expiry sequence inside one
//! watched scope. Retrying is the runner's job.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{Transaction, Ttl};
use super::runner::UnitOfWork;
use crate::error::{Result, WindowError};

/// Raw counter state read back from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReading {
    /// Whether this call created the counter
    pub created: bool,
    /// Counter value after the operation
    pub count: i64,
    /// Remaining TTL, `None` when the caller should assume a fresh period
    pub ttl: Option<Duration>,
}

/// Create the counter at 1, or increment it and make sure it expires.
#[derive(Debug, Clone, Copy)]
pub struct Increment {
    pub period: Duration,
}

#[async_trait]
impl<T: Transaction> UnitOfWork<T> for Increment {
    type Output = WindowReading;

    async fn attempt(&self, tx: &mut T) -> Result<WindowReading> {
        if tx.set_if_absent(1, self.period).await? {
            debug!(key = %tx.key(), period = ?self.period, "Created window counter");
            return Ok(WindowReading {
                created: true,
                count: 1,
                ttl: None,
            });
        }

        let (count, ttl) = tx.increment_and_ttl().await?;
        trace!(key = %tx.key(), count = count, ttl = ?ttl, "Incremented window counter");

        let ttl = match ttl {
            Ttl::Remaining(remaining) => Some(remaining),
            Ttl::NoExpiry => {
                // The key expired between the conditional set and the
                // increment, and the increment recreated it without a TTL.
                warn!(key = %tx.key(), period = ?self.period, "Window counter has no expiry, restoring it");
                if !tx.expire(self.period).await? {
                    return Err(WindowError::ExpiryFixupFailed);
                }
                None
            }
            Ttl::Absent => {
                warn!(key = %tx.key(), "Window counter vanished after increment");
                None
            }
        };

        Ok(WindowReading {
            created: false,
            count,
            ttl,
        })
    }
}

/// Read the counter and its TTL without modifying anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peek;

#[async_trait]
impl<T: Transaction> UnitOfWork<T> for Peek {
    type Output = WindowReading;

    async fn attempt(&self, tx: &mut T) -> Result<WindowReading> {
        let (count, ttl) = tx.get_and_ttl().await?;

        Ok(WindowReading {
            created: false,
            count: count.unwrap_or(0),
            ttl: ttl.remaining(),
        })
    }
}

/// Delete the counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reset;

#[async_trait]
impl<T: Transaction> UnitOfWork<T> for Reset {
    type Output = ();

    async fn attempt(&self, tx: &mut T) -> Result<()> {
        let removed = tx.delete().await?;
        trace!(key = %tx.key(), removed = removed, "Deleted window counter");
        Ok(())
    }
}
