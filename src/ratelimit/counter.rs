//! Fixed-window counters over a shared store.

use std::num::NonZeroU32;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::backend::Store;
use super::key::WindowKey;
use super::rate::Rate;
use super::runner::{CallContext, TransactionRunner};
use super::window::{Increment, Peek, Reset, WindowReading};
use crate::error::{Operation, Result};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "limiter";
/// Default number of attempts under contention.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Snapshot of a window as seen by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowState {
    /// When the operation started
    pub now: DateTime<Utc>,
    /// When the window resets
    pub expires_at: DateTime<Utc>,
    /// Events recorded in the window
    pub count: i64,
}

impl WindowState {
    fn new(now: DateTime<Utc>, ttl: Duration, count: i64) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            now,
            expires_at,
            count,
        }
    }

    /// Time left until the window resets.
    pub fn reset_in(&self) -> Duration {
        (self.expires_at - self.now).to_std().unwrap_or_default()
    }

    /// Events still allowed by `rate` in this window.
    pub fn remaining(&self, rate: &Rate) -> u64 {
        rate.limit
            .saturating_sub(u64::try_from(self.count).unwrap_or(0))
    }

    /// Whether the window holds more events than `rate` allows.
    pub fn is_exceeded(&self, rate: &Rate) -> bool {
        u64::try_from(self.count).is_ok_and(|count| count > rate.limit)
    }
}

/// Options for a [`WindowCounter`].
#[derive(Debug, Clone)]
pub struct CounterOptions {
    /// Namespace for every window key
    pub prefix: String,
    /// Attempts per operation under contention
    pub max_retry: NonZeroU32,
    /// Upper bound of the random pause between attempts
    pub retry_jitter: Duration,
}

impl Default for CounterOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_retry: NonZeroU32::new(DEFAULT_MAX_RETRY).unwrap_or(NonZeroU32::MIN),
            retry_jitter: Duration::ZERO,
        }
    }
}

/// Fixed-window counters keyed by identifier.
///
/// Holds no state of its own between calls: every operation re-reads the
/// store inside its own optimistic transaction, so any number of processes
/// can share the same counters.
#[derive(Debug, Clone)]
pub struct WindowCounter<S> {
    store: S,
    prefix: String,
    runner: TransactionRunner,
}

impl<S: Store> WindowCounter<S> {
    /// Create a counter with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, CounterOptions::default())
    }

    pub fn with_options(store: S, options: CounterOptions) -> Self {
        Self {
            store,
            prefix: options.prefix,
            runner: TransactionRunner::new(options.max_retry).with_jitter(options.retry_jitter),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_retry(&self) -> u32 {
        self.runner.max_retry()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The store key for `identifier`.
    pub fn window_key(&self, identifier: &str) -> WindowKey {
        WindowKey::new(&self.prefix, identifier)
    }

    /// Record one event for `identifier` and return the window state.
    pub async fn get(&self, ctx: &CallContext, identifier: &str, rate: &Rate) -> Result<WindowState> {
        let key = self.window_key(identifier);
        let now = Utc::now();

        trace!(key = %key, rate = %rate, "Recording event");

        let reading = self
            .runner
            .run(ctx, &self.store, key.as_str(), &Increment { period: rate.period })
            .await
            .map_err(|err| err.during(Operation::Get, key.as_str()))?;

        if reading.created {
            debug!(key = %key, "Started new window");
        }

        Ok(state_from(now, rate, reading))
    }

    /// Return the window state for `identifier` without recording an event.
    pub async fn peek(&self, ctx: &CallContext, identifier: &str, rate: &Rate) -> Result<WindowState> {
        let key = self.window_key(identifier);
        let now = Utc::now();

        trace!(key = %key, rate = %rate, "Peeking window");

        let reading = self
            .runner
            .run(ctx, &self.store, key.as_str(), &Peek)
            .await
            .map_err(|err| err.during(Operation::Peek, key.as_str()))?;

        Ok(state_from(now, rate, reading))
    }

    /// Clear the count for `identifier`.
    pub async fn reset(&self, ctx: &CallContext, identifier: &str, rate: &Rate) -> Result<WindowState> {
        let key = self.window_key(identifier);
        let now = Utc::now();

        self.runner
            .run(ctx, &self.store, key.as_str(), &Reset)
            .await
            .map_err(|err| err.during(Operation::Reset, key.as_str()))?;

        debug!(key = %key, "Window reset");
        Ok(WindowState::new(now, rate.period, 0))
    }
}

fn state_from(now: DateTime<Utc>, rate: &Rate, reading: WindowReading) -> WindowState {
    WindowState::new(now, reading.ttl.unwrap_or(rate.period), reading.count)
}
