//! Payment endpoint protected by the idempotency layer.
//!
//! Run with `cargo run --example memory_store`, then send the same request twice:
//!
//! ```sh
//! curl -i -X POST localhost:3000/payments -H 'Idempotency-Key: 123' -H 'x-user: alice'
//! curl -i -X POST localhost:3000/payments -H 'Idempotency-Key: 123' -H 'x-user: alice'
//! ```
//!
//! The second response carries `idempotency-relayed: 123` and the same payment id.

use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::post,
};
use axum_idempotency::{AuthenticatedActor, Config, Idempotency, IdempotencyLayer, MemoryStore, Result};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

#[derive(Clone, Default)]
struct Payments {
    next_id: Arc<AtomicU64>,
}

async fn create_payment(State(payments): State<Payments>) -> Json<Value> {
    let id = payments.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(id, "Payment created");
    Json(json!({ "id": id, "status": "captured" }))
}

/// Treats the `x-user` header as the authenticated caller.
async fn authenticate(mut request: Request, next: Next) -> Response {
    if let Some(user) = request
        .headers()
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    {
        request.extensions_mut().insert(AuthenticatedActor::new(user));
    }
    next.run(request).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let config: Config = r#"
        [idempotency]
        cache_duration = "1h"
        max_lock_wait_time = "5s"

        [logging]
        format = "compact"
    "#
    .parse()?;
    config.setup_tracing();
    config.validate()?;

    let store = MemoryStore::new();
    let _cleanup = store.spawn_cleanup(Duration::from_secs(30));

    let app = Router::new()
        .route("/payments", post(create_payment))
        .layer(IdempotencyLayer::new(Idempotency::new(config.idempotency, store)))
        .layer(middleware::from_fn(authenticate))
        .with_state(Payments::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!("Listening on http://127.0.0.1:3000");
    axum::serve(listener, app).await?;
    Ok(())
}
