//! Shared store boundary for recorded responses and execution locks.
//!
//! The middleware only needs five primitives from the store: a presence check,
//! get, put with a TTL, a non-blocking try-lock, and release. Implementations
//! backed by a shared cache (Redis, Memcached, a database) give singleflight
//! semantics across processes as long as:
//!
//! - `try_lock` is atomic: at most one caller gets a token for a key at a time;
//! - a `put` is visible to every subsequent `has`/`get`.
//!
//! A store that violates either can admit duplicate executions; the middleware
//! cannot detect that on its own.

use {
    crate::Result,
    async_trait::async_trait,
    axum::body::Bytes,
    std::{fmt, time::Duration},
    uuid::Uuid,
};

#[cfg(feature = "memory-store")]
use {
    dashmap::{DashMap, mapref::entry::Entry},
    std::sync::Arc,
    tokio::time::Instant,
    tokio_util::task::AbortOnDropHandle,
};

/// Proof of lock ownership returned by [`IdempotencyStore::try_lock`].
///
/// Releasing requires the token, so a holder whose lock already expired cannot
/// release the lock of whoever acquired it next.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Creates a new unique token.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({})", self.0)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage backend for recorded responses and execution locks.
///
/// Errors should use [`ErrorKind::Store`](crate::ErrorKind::Store), e.g. via
/// [`Error::store`](crate::Error::store).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if a live value exists at `key`.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Returns the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `value` at `key` for `ttl`.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Attempts once, without waiting, to take the lock at `lock_key`.
    /// The lock expires on its own after `ttl` if never released.
    async fn try_lock(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases the lock at `lock_key` if `token` still owns it.
    async fn release(&self, lock_key: &str, token: &LockToken) -> Result<()>;
}

/// Stored value with its expiry.
#[cfg(feature = "memory-store")]
#[derive(Clone)]
struct ValueEntry {
    value: Bytes,
    expires_at: Instant,
}

/// Held lock with its owner and expiry.
#[cfg(feature = "memory-store")]
#[derive(Clone)]
struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

/// In-process [`IdempotencyStore`] using DashMap for concurrent access.
///
/// Suitable for a single instance and for tests. Entries expire lazily on
/// access; call [`MemoryStore::spawn_cleanup`] to also sweep them periodically.
/// Clones share the same underlying maps.
#[cfg(feature = "memory-store")]
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, ValueEntry>>,
    locks: Arc<DashMap<String, LockEntry>>,
}

#[cfg(feature = "memory-store")]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if a live lock is held at `lock_key`.
    pub fn is_locked(&self, lock_key: &str) -> bool {
        self.locks
            .get(lock_key)
            .is_some_and(|lock| Instant::now() < lock.expires_at)
    }

    /// Removes expired values and locks.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.values.retain(|_, v| now < v.expires_at);
        self.locks.retain(|_, l| now < l.expires_at);
    }

    /// Spawns a background task sweeping expired entries every `interval`.
    /// The task stops when the returned handle is dropped.
    pub fn spawn_cleanup(&self, interval: Duration) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::spawn(cleanup_task(self.clone(), interval)))
    }

    fn live_value(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key) {
            if now < entry.expires_at {
                return Some(entry.value.clone());
            }
            // Expired, drop the reference so we can remove it
            drop(entry);
            self.values.remove_if(key, |_, v| v.expires_at <= now);
        }
        None
    }
}

#[cfg(feature = "memory-store")]
#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.live_value(key))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let entry = ValueEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.values.insert(key.to_string(), entry);
        Ok(())
    }

    async fn try_lock(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let token = LockToken::generate();
        let fresh = LockEntry {
            token: token.clone(),
            expires_at: now + ttl,
        };

        // The entry guard holds the shard lock, making check-and-set atomic.
        match self.locks.entry(lock_key.to_string()) {
            Entry::Occupied(mut held) => {
                if now < held.get().expires_at {
                    return Ok(None);
                }
                held.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(Some(token))
    }

    async fn release(&self, lock_key: &str, token: &LockToken) -> Result<()> {
        self.locks.remove_if(lock_key, |_, held| held.token == *token);
        Ok(())
    }
}

/// Periodically sweeps expired entries from `store`.
#[cfg(feature = "memory-store")]
async fn cleanup_task(store: MemoryStore, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        store.cleanup_expired();
        tracing::debug!("Cleaned up expired idempotency store entries");
    }
}
