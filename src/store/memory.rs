//! In-memory window store.
//!
//! Behaves like a single Redis node: keys expire lazily when touched, every
//! write bumps a per-key version, and pipelined commits abort when the version
//! observed at watch time has moved on. Useful for single-process deployments
//! and for exercising the counter protocol without a server.
//!
//! Deleted and expired keys leave tombstones behind until they are purged;
//! long-lived stores should be built with [`MemoryStore::with_cleanup_interval`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::parse_count;
use crate::error::{Result, WindowError};
use crate::ratelimit::{Store, Transaction, Ttl};

#[derive(Debug)]
struct Slot {
    value: Option<String>,
    /// `None` also when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
    version: u64,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            value: None,
            expires_at: None,
            version: 0,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.value.is_some() && self.expires_at.map_or(true, |at| at > now)
    }

    fn ttl(&self, now: Instant) -> Ttl {
        match (&self.value, self.expires_at) {
            (None, _) => Ttl::Absent,
            (Some(_), None) => Ttl::NoExpiry,
            (Some(_), Some(at)) if at > now => Ttl::Remaining(at - now),
            (Some(_), Some(_)) => Ttl::Absent,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: DashMap<String, Slot>,
    clock: AtomicU64,
}

impl Inner {
    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Turn an expired entry into a tombstone, which counts as a modification.
    fn expire_if_due(&self, slot: &mut Slot, now: Instant) {
        if slot.value.is_some() && !slot.is_live(now) {
            slot.value = None;
            slot.expires_at = None;
            slot.version = self.next_version();
        }
    }

    /// Inspect a key without creating it.
    fn read<R>(&self, key: &str, f: impl FnOnce(Option<&Slot>, Instant) -> R) -> R {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                self.expire_if_due(&mut slot, now);
                f(Some(&*slot), now)
            }
            None => f(None, now),
        }
    }

    /// Mutate a key, creating a vacant slot if needed.
    fn write<R>(&self, key: &str, f: impl FnOnce(&mut Slot, Instant) -> R) -> R {
        let now = Instant::now();
        let mut slot = self
            .slots
            .entry(key.to_owned())
            .or_insert_with(Slot::vacant);
        self.expire_if_due(&mut slot, now);
        f(&mut *slot, now)
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            self.expire_if_due(slot, now);
            slot.value.is_some()
        });
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired window counters");
        }
        purged
    }

    fn version(&self, key: &str) -> u64 {
        self.read(key, |slot, _| slot.map_or(0, |slot| slot.version))
    }
}

/// Process-local store with Redis-like expiry and optimistic watch semantics.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw value, replacing any existing entry.
    ///
    /// `ttl = None` stores the key without an expiry.
    pub fn insert(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let version = self.inner.next_version();
        self.inner.write(key, |slot, now| {
            slot.value = Some(value.into());
            slot.expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
            slot.version = version;
        });
    }

    /// Create a store that drops expired and deleted entries every `interval`.
    ///
    /// The sweeper stops once the last handle to the store is dropped. A zero
    /// interval disables it.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_cleanup_interval(interval: Duration) -> Self {
        let store = Self::new();
        if interval.is_zero() {
            return store;
        }

        let inner = Arc::downgrade(&store.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.purge_expired();
            }
            debug!("Memory store sweeper stopped");
        });

        store
    }

    /// Drop expired and deleted entries.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn watch(&self, key: &str) -> Result<MemoryTransaction> {
        let watched = self.inner.version(key);
        Ok(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
            watched,
        })
    }
}

/// A watched scope over one key of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    key: String,
    watched: u64,
}

impl MemoryTransaction {
    fn check_watch(&self, slot: Option<&Slot>) -> Result<()> {
        if slot.map_or(0, |slot| slot.version) != self.watched {
            return Err(WindowError::OptimisticConflict);
        }
        Ok(())
    }

    fn increment_slot(&self, slot: &mut Slot) -> Result<i64> {
        let current = match &slot.value {
            Some(raw) => parse_count(raw)?,
            None => 0,
        };
        let next = current.checked_add(1).ok_or_else(|| {
            WindowError::MalformedState("increment would overflow".to_string())
        })?;

        slot.value = Some(next.to_string());
        slot.version = self.inner.next_version();
        Ok(next)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&mut self) -> Result<Option<i64>> {
        self.inner.read(&self.key, |slot, _| {
            slot.and_then(|slot| slot.value.as_deref())
                .map(parse_count)
                .transpose()
        })
    }

    async fn set_if_absent(&mut self, value: i64, ttl: Duration) -> Result<bool> {
        Ok(self.inner.write(&self.key, |slot, now| {
            if slot.value.is_some() {
                return false;
            }
            slot.value = Some(value.to_string());
            slot.expires_at = now.checked_add(ttl);
            slot.version = self.inner.next_version();
            true
        }))
    }

    async fn increment(&mut self) -> Result<i64> {
        self.inner
            .write(&self.key, |slot, _| self.increment_slot(slot))
    }

    async fn remaining_ttl(&mut self) -> Result<Ttl> {
        Ok(self
            .inner
            .read(&self.key, |slot, now| slot.map_or(Ttl::Absent, |slot| slot.ttl(now))))
    }

    async fn expire(&mut self, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let Some(mut slot) = self.inner.slots.get_mut(&self.key) else {
            return Ok(false);
        };
        self.inner.expire_if_due(&mut slot, now);
        if slot.value.is_none() {
            return Ok(false);
        }
        slot.expires_at = now.checked_add(ttl);
        slot.version = self.inner.next_version();
        Ok(true)
    }

    async fn delete(&mut self) -> Result<u64> {
        let now = Instant::now();
        let Some(mut slot) = self.inner.slots.get_mut(&self.key) else {
            return Ok(0);
        };
        self.inner.expire_if_due(&mut slot, now);
        if slot.value.is_none() {
            return Ok(0);
        }
        slot.value = None;
        slot.expires_at = None;
        slot.version = self.inner.next_version();
        Ok(1)
    }

    async fn increment_and_ttl(&mut self) -> Result<(i64, Ttl)> {
        self.inner.write(&self.key, |slot, now| {
            // A slot created by this write has version 0, same as a missing key.
            self.check_watch(Some(slot))?;
            let count = self.increment_slot(slot)?;
            Ok((count, slot.ttl(now)))
        })
    }

    async fn get_and_ttl(&mut self) -> Result<(Option<i64>, Ttl)> {
        self.inner.read(&self.key, |slot, now| {
            self.check_watch(slot)?;
            let count = slot
                .and_then(|slot| slot.value.as_deref())
                .map(parse_count)
                .transpose()?;
            let ttl = slot.map_or(Ttl::Absent, |slot| slot.ttl(now));
            Ok((count, ttl))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_only_once() {
        let store = MemoryStore::new();
        let mut tx = store.watch("k").await.unwrap();

        assert!(tx.set_if_absent(1, PERIOD).await.unwrap());
        assert!(!tx.set_if_absent(1, PERIOD).await.unwrap());
        assert_eq!(tx.get().await.unwrap(), Some(1));
        assert_eq!(tx.remaining_ttl().await.unwrap(), Ttl::Remaining(PERIOD));
    }

    #[tokio::test]
    async fn test_increment_creates_key_without_expiry() {
        let store = MemoryStore::new();
        let mut tx = store.watch("k").await.unwrap();

        assert_eq!(tx.increment().await.unwrap(), 1);
        assert_eq!(tx.remaining_ttl().await.unwrap(), Ttl::NoExpiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        store.insert("k", "3", Some(Duration::from_secs(1)));
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;

        let mut tx = store.watch("k").await.unwrap();
        assert_eq!(tx.get().await.unwrap(), None);
        assert_eq!(tx.remaining_ttl().await.unwrap(), Ttl::Absent);
        assert!(!tx.expire(PERIOD).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_commit_conflicts_after_foreign_write() {
        let store = MemoryStore::new();
        store.insert("k", "1", Some(PERIOD));

        let mut watcher = store.watch("k").await.unwrap();
        store.insert("k", "10", Some(PERIOD));

        let err = watcher.increment_and_ttl().await.unwrap_err();
        assert!(err.is_conflict());
        let err = watcher.get_and_ttl().await.unwrap_err();
        assert!(err.is_conflict());

        let mut fresh = store.watch("k").await.unwrap();
        assert_eq!(fresh.increment_and_ttl().await.unwrap().0, 11);
    }

    #[tokio::test]
    async fn test_commit_conflicts_when_watched_absent_key_is_created() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("k").await.unwrap();

        let mut other = store.watch("k").await.unwrap();
        assert!(other.set_if_absent(1, PERIOD).await.unwrap());

        assert!(watcher.increment_and_ttl().await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let store = MemoryStore::new();
        store.insert("a", "1", Some(PERIOD));
        store.insert("b", "1", Some(PERIOD));

        let mut tx = store.watch("a").await.unwrap();
        assert_eq!(tx.delete().await.unwrap(), 1);
        assert_eq!(tx.delete().await.unwrap(), 0);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_value() {
        let store = MemoryStore::new();
        store.insert("k", "abc", None);
        let mut tx = store.watch("k").await.unwrap();

        assert!(matches!(
            tx.get().await.unwrap_err(),
            WindowError::MalformedState(_)
        ));
        assert!(matches!(
            tx.increment().await.unwrap_err(),
            WindowError::MalformedState(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_interval_drops_tombstones() {
        let store = MemoryStore::with_cleanup_interval(Duration::from_secs(1));
        for id in 0..100 {
            store.insert(&format!("k{id}"), "1", Some(Duration::from_secs(1)));
        }
        store.insert("kept", "1", Some(PERIOD));

        let mut tx = store.watch("gone").await.unwrap();
        assert_eq!(tx.increment().await.unwrap(), 1);
        assert_eq!(tx.delete().await.unwrap(), 1);
        assert_eq!(store.inner.slots.len(), 102);

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(store.inner.slots.len(), 1);
        assert_eq!(store.len(), 1);
        let mut tx = store.watch("kept").await.unwrap();
        assert_eq!(tx.get().await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstones_stay_without_cleanup_interval() {
        let store = MemoryStore::new();
        store.insert("k", "1", Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut tx = store.watch("k").await.unwrap();
        assert_eq!(tx.get().await.unwrap(), None);
        assert_eq!(store.inner.slots.len(), 1);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.inner.slots.len(), 0);
    }
}
