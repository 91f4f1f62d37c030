//! Integration tests for the idempotency layer on an axum router
//!
//! ## Test Coverage
//!
//! - Non-enforced methods bypass the store entirely
//! - Replays return the recorded status, headers and body plus `Idempotency-Relayed`
//! - Recorded responses are scoped per authenticated actor and per resolver
//! - Key reuse on another path is rejected in both duplicate modes
//! - Missing keys, custom header names and invalid configuration
//! - `from_fn_with_state` integration and hot-reloaded configuration

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_idempotency::{
    ActorResolver, AuthenticatedActor, DuplicateBehaviour, Idempotency, IdempotencyConfig,
    IdempotencyLayer, IdempotencyStore, LockToken, MemoryStore, ResolverRegistry, Result,
    idempotency_middleware,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tower::ServiceExt;

/// Application state containing a counter
#[derive(Clone)]
struct AppState {
    counter: Arc<AtomicU32>,
}

impl AppState {
    fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    fn get(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Handler that increments a counter on each call
async fn counter_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::CREATED,
        [("x-count", count.to_string())],
        format!("Count: {count}"),
    )
}

/// Stands in for an authentication layer: `x-user` becomes the actor.
async fn fake_auth(mut request: Request, next: Next) -> Response {
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

fn app(idempotency: Idempotency, state: AppState) -> Router {
    Router::new()
        .route("/account", post(counter_handler).get(counter_handler).put(counter_handler))
        .route("/other", post(counter_handler))
        .layer(IdempotencyLayer::new(idempotency))
        .layer(middleware::from_fn(fake_auth))
        .with_state(state)
}

fn request(method: Method, uri: &str, key: Option<&str>) -> Request {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::empty()).unwrap()
}

fn request_as(user: &str, uri: &str, key: &str) -> Request {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("Idempotency-Key", key)
        .header("x-user", user)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn error_code(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    json["error_code"].as_str().unwrap().to_string()
}

/// Store wrapper counting every call made to it.
#[derive(Clone, Default)]
struct CountingStore {
    inner: MemoryStore,
    calls: Arc<AtomicUsize>,
}

impl CountingStore {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdempotencyStore for CountingStore {
    async fn has(&self, key: &str) -> Result<bool> {
        self.count();
        self.inner.has(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.count();
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.count();
        self.inner.put(key, value, ttl).await
    }

    async fn try_lock(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        self.count();
        self.inner.try_lock(lock_key, ttl).await
    }

    async fn release(&self, lock_key: &str, token: &LockToken) -> Result<()> {
        self.count();
        self.inner.release(lock_key, token).await
    }
}

#[tokio::test]
async fn test_non_enforced_method_skips_store() {
    let store = CountingStore::default();
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), store.clone()),
        state.clone(),
    );

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/account", Some("K")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("idempotency-relayed").is_none());
    }

    assert_eq!(state.get(), 2);
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_enforced_method_without_key_is_rejected() {
    let store = CountingStore::default();
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), store.clone()),
        state.clone(),
    );

    let response = app
        .oneshot(request(Method::POST, "/account", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MISSING_IDEMPOTENCY_KEY");
    assert_eq!(state.get(), 0);
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_replay_is_identical_with_relayed_header() {
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), MemoryStore::new()),
        state.clone(),
    );

    let first = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    let second = app
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();

    assert_eq!(state.get(), 1);
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(first.headers().get("idempotency-relayed").is_none());
    assert_eq!(second.headers().get("idempotency-relayed").unwrap(), "K");
    assert_eq!(
        first.headers().get("x-count"),
        second.headers().get("x-count")
    );
    assert_eq!(
        first.headers().get("content-type"),
        second.headers().get("content-type")
    );
    assert_eq!(body_string(first).await, body_string(second).await);
}

#[tokio::test]
async fn test_distinct_keys_execute_independently() {
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), MemoryStore::new()),
        state.clone(),
    );

    let a = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("A")))
        .await
        .unwrap();
    let b = app
        .oneshot(request(Method::POST, "/account", Some("B")))
        .await
        .unwrap();

    assert_eq!(state.get(), 2);
    assert_eq!(body_string(a).await, "Count: 1");
    assert_eq!(body_string(b).await, "Count: 2");
}

#[tokio::test]
async fn test_actors_are_isolated() {
    let store = MemoryStore::new();
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), store.clone()),
        state.clone(),
    );

    let alice = app
        .clone()
        .oneshot(request_as("alice", "/account", "K"))
        .await
        .unwrap();
    let bob = app
        .clone()
        .oneshot(request_as("bob", "/account", "K"))
        .await
        .unwrap();
    let alice_again = app
        .oneshot(request_as("alice", "/account", "K"))
        .await
        .unwrap();

    assert_eq!(state.get(), 2);
    assert!(bob.headers().get("idempotency-relayed").is_none());
    assert_eq!(body_string(alice).await, "Count: 1");
    assert_eq!(body_string(bob).await, "Count: 2");
    assert_eq!(body_string(alice_again).await, "Count: 1");

    assert!(store.has("idempotency:alice:K").await.unwrap());
    assert!(store.has("idempotency:bob:K").await.unwrap());
}

#[tokio::test]
async fn test_anonymous_requests_share_global_actor() {
    let store = MemoryStore::new();
    let state = AppState::new();
    let app = app(
        Idempotency::new(IdempotencyConfig::default(), store.clone()),
        state.clone(),
    );

    app.oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();

    assert!(store.has("idempotency:global:K").await.unwrap());
}

#[tokio::test]
async fn test_callback_resolver_scopes_keys() {
    let store = MemoryStore::new();
    let config = IdempotencyConfig::default()
        .with_user_id_resolver(ActorResolver::callback(|_| Some("custom-user-id".into())));
    let app = app(Idempotency::new(config, store.clone()), AppState::new());

    // The resolver wins over the authenticated actor
    app.oneshot(request_as("alice", "/account", "K"))
        .await
        .unwrap();

    assert!(store.has("idempotency:custom-user-id:K").await.unwrap());
    assert!(!store.has("idempotency:alice:K").await.unwrap());
}

#[tokio::test]
async fn test_named_resolver_from_toml() {
    let config: axum_idempotency::Config = r#"
        [idempotency]
        user_id_resolver = ["TenantResolver", "current_tenant"]
    "#
    .parse()
    .unwrap();

    let registry = ResolverRegistry::new().register("TenantResolver", "current_tenant", |request| {
        request
            .headers()
            .get("x-tenant")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let store = MemoryStore::new();
    let idempotency =
        Idempotency::new(config.idempotency, store.clone()).with_resolver_registry(registry);
    let app = app(idempotency, AppState::new());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/account")
        .header("Idempotency-Key", "K")
        .header("x-tenant", "acme")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(store.has("idempotency:acme:K").await.unwrap());
}

#[tokio::test]
async fn test_unregistered_resolver_is_configuration_error() {
    let config = IdempotencyConfig::default()
        .with_user_id_resolver(ActorResolver::reference("Missing", "resolve"));
    let state = AppState::new();
    let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());

    let response = app
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "INVALID_CONFIGURATION");
    assert_eq!(state.get(), 0);
}

#[tokio::test]
async fn test_key_reused_on_other_path_is_rejected() {
    for behaviour in DuplicateBehaviour::ALL {
        let state = AppState::new();
        let config = IdempotencyConfig::default().with_duplicate_behaviour(behaviour);
        let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());

        app.clone()
            .oneshot(request(Method::POST, "/account", Some("K")))
            .await
            .unwrap();
        let response = app
            .oneshot(request(Method::POST, "/other", Some("K")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{behaviour}");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error_code"], "MISMATCHED_PATH");
        assert_eq!(
            json["message"],
            "Idempotency key previously used on different route (/account)."
        );
        assert_eq!(json["details"], "idempotency_key=K");
        assert_eq!(state.get(), 1);
    }
}

#[tokio::test]
async fn test_exception_mode_rejects_duplicates() {
    let state = AppState::new();
    let config = IdempotencyConfig::default().with_duplicate_behaviour(DuplicateBehaviour::Exception);
    let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());

    let first = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    let second = app
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();

    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(error_code(second).await, "DUPLICATE_REQUEST");
    assert_eq!(state.get(), 1);
}

#[tokio::test]
async fn test_non_ascii_key_is_replayed_in_every_mode() {
    let key = "café-1";
    for ignore_empty_key in [false, true] {
        let state = AppState::new();
        let config = IdempotencyConfig::default().with_ignore_empty_key(ignore_empty_key);
        let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());
        let keyed = || {
            Request::builder()
                .method(Method::POST)
                .uri("/account")
                .header("Idempotency-Key", HeaderValue::from_bytes(key.as_bytes()).unwrap())
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(keyed()).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let replay = app.oneshot(keyed()).await.unwrap();

        assert_eq!(replay.status(), StatusCode::CREATED, "ignore_empty_key={ignore_empty_key}");
        assert_eq!(replay.headers()["idempotency-relayed"].as_bytes(), key.as_bytes());
        assert_eq!(state.get(), 1, "ignore_empty_key={ignore_empty_key}");
    }
}

#[tokio::test]
async fn test_custom_header_name() {
    let state = AppState::new();
    let config = IdempotencyConfig::default().with_idempotency_header("X-Request-Token");
    let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());

    let with_default_header = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    assert_eq!(with_default_header.status(), StatusCode::BAD_REQUEST);

    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/account")
            .header("x-request-token", "K")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(state.get(), 1);
}

#[tokio::test]
async fn test_custom_enforced_verbs() {
    let state = AppState::new();
    let config = IdempotencyConfig::default().with_enforced_verbs(["post"]);
    let app = app(Idempotency::new(config, MemoryStore::new()), state.clone());

    // PUT is no longer enforced
    let put = app
        .clone()
        .oneshot(request(Method::PUT, "/account", None))
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);

    let post = app
        .oneshot(request(Method::POST, "/account", None))
        .await
        .unwrap();
    assert_eq!(post.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_configuration_rejects_every_request() {
    let store = CountingStore::default();
    let state = AppState::new();
    let config = IdempotencyConfig::default().with_enforced_verbs(["POST", "FETCH"]);
    let app = app(Idempotency::new(config, store.clone()), state.clone());

    // Even a method that would not be enforced fails the gate
    for method in [Method::POST, Method::GET] {
        let response = app
            .clone()
            .oneshot(request(method, "/account", Some("K")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "INVALID_CONFIGURATION");
    }

    assert_eq!(state.get(), 0);
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_from_fn_with_state_integration() {
    let state = AppState::new();
    let idempotency = Idempotency::new(IdempotencyConfig::default(), MemoryStore::new());
    let app = Router::new()
        .route("/account", post(counter_handler))
        .layer(middleware::from_fn_with_state(idempotency, idempotency_middleware))
        .with_state(state.clone());

    let first = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    let second = app
        .clone()
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    let missing = app
        .oneshot(request(Method::POST, "/account", None))
        .await
        .unwrap();

    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(second.headers().get("idempotency-relayed").unwrap(), "K");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.get(), 1);
}

#[tokio::test]
async fn test_reloaded_configuration_applies_to_next_request() {
    let state = AppState::new();
    let (tx, rx) = tokio::sync::watch::channel(IdempotencyConfig::default());
    let app = app(Idempotency::reloadable(rx, MemoryStore::new()), state.clone());

    let before = app
        .clone()
        .oneshot(request(Method::POST, "/account", None))
        .await
        .unwrap();
    assert_eq!(before.status(), StatusCode::BAD_REQUEST);

    tx.send(IdempotencyConfig::default().with_ignore_empty_key(true))
        .unwrap();

    let after = app
        .clone()
        .oneshot(request(Method::POST, "/account", None))
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::CREATED);

    tx.send(IdempotencyConfig {
        on_duplicate_behaviour: "ignore".into(),
        ..Default::default()
    })
    .unwrap();

    let broken = app
        .oneshot(request(Method::POST, "/account", Some("K")))
        .await
        .unwrap();
    assert_eq!(error_code(broken).await, "INVALID_CONFIGURATION");
    assert_eq!(state.get(), 1);
}
