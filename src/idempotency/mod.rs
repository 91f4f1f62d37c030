//! Idempotency-Key coordination.
//!
//! Each enforced request is processed as:
//!
//! ```text
//! validate config ─┬─ method not enforced ──────────────────────► handler
//!                  ├─ no key ─┬─ ignore_empty_key ───────────────► handler
//!                  │          └─────────────────────────────────► MissingIdempotencyKey
//!                  └─ resolve actor, build key
//!                       ├─ recorded ──► replay (or MismatchedPath / DuplicateRequest)
//!                       ├─ lock taken ─┬─ recorded meanwhile ─► replay, release
//!                       │              └─► handler, record, release ─► fresh response
//!                       └─ lock busy ──► poll once per second ─┬─► replay
//!                                                              └─► LockWaitExceeded
//! ```
//!
//! - `key`: cache and lock key derivation
//! - `cached`: the recorded response and its stored forms
//! - `actor`: who a recorded response belongs to
//! - `store`: the storage boundary and the in-process `MemoryStore`
//! - `middleware`: [`Idempotency`], [`IdempotencyLayer`] and [`idempotency_middleware`]

mod actor;
mod cached;
mod key;
mod middleware;
mod store;

pub use {
    actor::{ActorResolver, AuthenticatedActor, GLOBAL_ACTOR, ResolveFn, ResolverRef, ResolverRegistry},
    cached::{CachedHeaders, CachedResponse, RELAYED_HEADER},
    key::{CACHE_KEY_PREFIX, LOCK_KEY_PREFIX, build_cache_key, build_lock_key},
    middleware::{Idempotency, IdempotencyLayer, IdempotencyService, idempotency_middleware},
    store::{IdempotencyStore, LockToken},
};

#[cfg(feature = "memory-store")]
pub use store::MemoryStore;
