//! Cache and lock key derivation.
//!
//! Keys are plain interpolations: `idempotency:{actor}:{token}` and
//! `lock:{cache_key}`. Actor ids and tokens are not escaped, so an actor id
//! containing `:` can collide with another actor whose token starts with the
//! remainder. Callers that accept arbitrary actor ids should keep `:` out of them.

/// Prefix of every cached response key.
pub const CACHE_KEY_PREFIX: &str = "idempotency";

/// Prefix of every execution lock key.
pub const LOCK_KEY_PREFIX: &str = "lock";

/// Builds the store key holding the response for `token` issued by `actor_id`.
pub fn build_cache_key(actor_id: &str, token: &str) -> String {
    format!("{CACHE_KEY_PREFIX}:{actor_id}:{token}")
}

/// Builds the lock key guarding execution for `cache_key`.
pub fn build_lock_key(cache_key: &str) -> String {
    format!("{LOCK_KEY_PREFIX}:{cache_key}")
}
