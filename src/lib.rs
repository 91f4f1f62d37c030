//! # axum-idempotency
//!
//! Idempotency-Key middleware for Axum. Clients attach a key to unsafe
//! requests; the first request with a given key runs and its response is
//! recorded, retries get the recorded response back instead of running the
//! handler again.
//!
//! Concurrent duplicates are serialized through a lock in the shared store:
//! exactly one executes, the others wait for its response and replay it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::post};
//! use axum_idempotency::{Config, Idempotency, IdempotencyLayer, MemoryStore, Result};
//!
//! async fn create_payment() -> &'static str {
//!     "{\"id\": 1}"
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::default();  // Loads from config/{RUST_ENV}.toml
//!     config.setup_tracing();
//!     config.validate()?;
//!
//!     let store = MemoryStore::new();
//!     let _cleanup = store.spawn_cleanup(std::time::Duration::from_secs(60));
//!
//!     let app = Router::new()
//!         .route("/payments", post(create_payment))
//!         .layer(IdempotencyLayer::new(Idempotency::new(config.idempotency, store)));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! With `config/dev.toml`:
//! ```toml
//! [idempotency]
//! cache_duration = "1day"
//! enforced_verbs = ["POST", "PUT", "PATCH", "DELETE"]
//! max_lock_wait_time = "10s"
//! ```
//!
//! Run with `RUST_ENV=dev cargo run`.
//!
//! # Behaviour
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Method not in `enforced_verbs` | Handler runs, store untouched |
//! | Key header missing or empty | `400 MISSING_IDEMPOTENCY_KEY`, or pass-through with `ignore_empty_key` |
//! | First request for a key | Handler runs, response recorded for `cache_duration` |
//! | Repeat of a completed request | Recorded response with `Idempotency-Relayed: <key>` |
//! | Repeat with `on_duplicate_behaviour = "exception"` | `409 DUPLICATE_REQUEST` |
//! | Key reused on another path | `422 MISMATCHED_PATH` |
//! | Repeat while the first is still running | Waits up to `max_lock_wait_time`, then replays or `409 LOCK_WAIT_EXCEEDED` |
//!
//! Recorded responses are scoped per actor. Without a configured
//! `user_id_resolver`, the actor comes from the [`AuthenticatedActor`] request
//! extension, falling back to a shared `"global"` actor.
//!
//! # Cargo Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `memory-store` | In-process [`IdempotencyStore`] backed by DashMap (default) |
//!
//! Multi-instance deployments implement [`IdempotencyStore`] over a shared
//! cache with an atomic try-lock.
//!
//! # Error Handling
//!
//! The library uses a custom [`Result`] type. Errors convert to structured JSON responses:
//!
//! ```json
//! {
//!   "error_code": "MISMATCHED_PATH",
//!   "message": "Idempotency key previously used on different route (/payments).",
//!   "details": "idempotency_key=123"
//! }
//! ```
mod config;
mod error;
mod idempotency;
mod utils;

pub use config::*;
pub use error::*;
pub use idempotency::*;
pub use utils::*;

pub type Result<T> = std::result::Result<T, Error>;
