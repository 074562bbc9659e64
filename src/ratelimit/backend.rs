//! Store capability traits for window counters.
//!
//! A window counter only needs a handful of single-key primitives plus an
//! optimistic transaction scope. Any store with per-key atomicity and a
//! watch-then-commit style transaction can implement these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Remaining lifetime of a key, decoded from the store's sentinel replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key exists and expires after this duration
    Remaining(Duration),
    /// The key exists but has no expiry configured
    NoExpiry,
    /// The key does not exist
    Absent,
}

impl Ttl {
    /// Raw sentinel for "exists, no expiry".
    const NO_EXPIRY_RAW: i64 = -1;
    /// Raw sentinel for "no such key".
    const ABSENT_RAW: i64 = -2;
    const NANOS_PER_MILLI: i64 = 1_000_000;

    /// Decode a millisecond TTL reply (e.g. `PTTL`).
    pub fn from_millis(raw: i64) -> Self {
        match raw {
            Self::NO_EXPIRY_RAW => Ttl::NoExpiry,
            n if n > 0 => Ttl::Remaining(Duration::from_millis(n as u64)),
            _ => Ttl::Absent,
        }
    }

    /// Decode a TTL expressed as signed nanoseconds.
    ///
    /// For stores whose client hands back TTLs as scaled durations rather than
    /// raw `PTTL` replies. Clients disagree on whether the sentinels keep their
    /// raw value or get scaled to the reply unit, so both `-1` and `-1ms` mean
    /// "no expiry" (and `-2` / `-2ms` mean "absent"). The bundled stores read
    /// raw milliseconds and use [`Ttl::from_millis`].
    pub fn from_nanos(raw: i64) -> Self {
        match raw {
            n if n > 0 => Ttl::Remaining(Duration::from_nanos(n as u64)),
            n if n == Self::NO_EXPIRY_RAW || n == Self::NO_EXPIRY_RAW * Self::NANOS_PER_MILLI => {
                Ttl::NoExpiry
            }
            _ => Ttl::Absent,
        }
    }

    /// Whether the key must be given an expiry before it is valid.
    pub fn needs_expiry(&self) -> bool {
        matches!(self, Ttl::NoExpiry)
    }

    /// The remaining duration, if a positive TTL was observed.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::Remaining(d) => Some(*d),
            Ttl::NoExpiry | Ttl::Absent => None,
        }
    }
}

/// A store that can open optimistic transactions on a single key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Transaction handle bound to one watched key.
    type Transaction: Transaction;

    /// Start watching `key`.
    ///
    /// Pipelined commits on the returned handle abort with
    /// [`WindowError::OptimisticConflict`](crate::error::WindowError::OptimisticConflict)
    /// if the key was modified after this call.
    async fn watch(&self, key: &str) -> Result<Self::Transaction>;
}

/// Single-key primitives available inside an optimistic scope.
///
/// Immediate operations apply right away and count as modifications of the
/// watched key. The `*_and_ttl` operations are pipelined and commit atomically,
/// failing with a conflict if the key changed since the scope was opened.
#[async_trait]
pub trait Transaction: Send {
    /// The watched key.
    fn key(&self) -> &str;

    /// Read the counter, `None` if absent.
    async fn get(&mut self) -> Result<Option<i64>>;

    /// Create the key with `value` and `ttl` unless it already exists.
    async fn set_if_absent(&mut self, value: i64, ttl: Duration) -> Result<bool>;

    /// Increment the counter. A missing key is created at 1 with no expiry.
    async fn increment(&mut self) -> Result<i64>;

    /// Read the remaining TTL.
    async fn remaining_ttl(&mut self) -> Result<Ttl>;

    /// Set an expiry. Returns `false` if the key does not exist.
    async fn expire(&mut self, ttl: Duration) -> Result<bool>;

    /// Delete the key, returning the number of keys removed.
    async fn delete(&mut self) -> Result<u64>;

    /// Atomically increment and read the TTL.
    async fn increment_and_ttl(&mut self) -> Result<(i64, Ttl)>;

    /// Atomically read the counter and its TTL.
    async fn get_and_ttl(&mut self) -> Result<(Option<i64>, Ttl)>;
}
