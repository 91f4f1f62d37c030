//! Request coordination and its tower / axum integration.

use {
    super::{
        actor::{ResolverRegistry, resolve_actor},
        cached::CachedResponse,
        key::{build_cache_key, build_lock_key},
        store::{IdempotencyStore, LockToken},
    },
    crate::{DuplicateBehaviour, Error, IdempotencyConfig, IdempotencyPolicy, Result},
    axum::{
        body::Body,
        extract::{Request, State},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    http::HeaderName,
    http_body_util::BodyExt,
    std::{
        convert::Infallible,
        fmt,
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    },
    tokio::sync::watch,
    tower::{Layer, Service, ServiceExt},
};

/// Delay between two cache checks while another request holds the lock.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the configuration snapshot for each request comes from.
#[derive(Clone)]
enum ConfigSource {
    Static(Arc<IdempotencyConfig>),
    Watch(watch::Receiver<IdempotencyConfig>),
}

/// Shared idempotency state: configuration source, store and named resolvers.
///
/// Cheap to clone. Use it through [`IdempotencyLayer`], through
/// [`idempotency_middleware`] with `axum::middleware::from_fn_with_state`, or
/// directly with [`Idempotency::handle`].
///
/// ```rust
/// use axum::{Router, routing::post};
/// use axum_idempotency::{Idempotency, IdempotencyConfig, IdempotencyLayer, MemoryStore};
///
/// let idempotency = Idempotency::new(IdempotencyConfig::default(), MemoryStore::new());
/// let app: Router = Router::new()
///     .route("/payments", post(|| async { "created" }))
///     .layer(IdempotencyLayer::new(idempotency));
/// ```
#[derive(Clone)]
pub struct Idempotency {
    config: ConfigSource,
    store: Arc<dyn IdempotencyStore>,
    resolvers: Arc<ResolverRegistry>,
}

impl Idempotency {
    /// Creates state with a fixed configuration.
    pub fn new<S>(config: IdempotencyConfig, store: S) -> Self
    where
        S: IdempotencyStore + 'static,
    {
        Self {
            config: ConfigSource::Static(Arc::new(config)),
            store: Arc::new(store),
            resolvers: Arc::default(),
        }
    }

    /// Creates state whose configuration follows `config`. Each request reads
    /// the latest value once and uses it throughout.
    pub fn reloadable<S>(config: watch::Receiver<IdempotencyConfig>, store: S) -> Self
    where
        S: IdempotencyStore + 'static,
    {
        Self {
            config: ConfigSource::Watch(config),
            store: Arc::new(store),
            resolvers: Arc::default(),
        }
    }

    /// Installs the resolvers that `user_id_resolver = ["Service", "method"]`
    /// references are looked up in.
    pub fn with_resolver_registry(mut self, registry: ResolverRegistry) -> Self {
        self.resolvers = Arc::new(registry);
        self
    }

    /// Validates the current configuration snapshot.
    pub fn policy(&self) -> Result<IdempotencyPolicy> {
        match &self.config {
            ConfigSource::Static(config) => config.validate(),
            ConfigSource::Watch(config) => config.borrow().validate(),
        }
    }

    /// Runs `request` through the idempotency checks, calling `next` at most
    /// once.
    ///
    /// Non-enforced methods, and requests without a key when empty keys are
    /// ignored, go straight to `next`. Otherwise the first request for a
    /// key executes while holding the lock and records its response; later
    /// requests replay it, or wait for it while the first is still running.
    pub async fn handle<F, Fut>(&self, request: Request, next: F) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let policy = self.policy()?;

        if !policy.enforces(request.method()) {
            tracing::debug!(method = %request.method(), "Method not enforced, skipping idempotency");
            return Ok(next(request).await);
        }

        let Some(token) = extract_token(&request, &policy.header) else {
            if policy.ignore_empty_key {
                tracing::debug!(header = %policy.header_label, "No idempotency key, passing through");
                return Ok(next(request).await);
            }
            return Err(Error::missing_key(format!(
                "Idempotency key \"{}\" not found.",
                policy.header_label
            )));
        };

        let actor = resolve_actor(policy.user_id_resolver.as_ref(), &self.resolvers, &request)?;
        let cache_key = build_cache_key(&actor, &token);
        let path = request.uri().path().to_string();

        if let Some(response) = self.replay_recorded(&policy, &cache_key, &path, &token).await? {
            return Ok(response);
        }

        let lock_key = build_lock_key(&cache_key);
        let Some(lock_token) = self.store.try_lock(&lock_key, policy.lock_timeout).await? else {
            tracing::debug!(%cache_key, "Idempotency key in flight, waiting for its response");
            return self.wait_for_response(&policy, &cache_key, &path, &token).await;
        };

        let lock = HeldLock::new(self.store.clone(), lock_key, lock_token);
        // A request holding the lock may have recorded and released after our first check.
        let response = match self.replay_recorded(&policy, &cache_key, &path, &token).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.execute_and_record(&policy, &cache_key, path, token, request, next)
                    .await
            }
            Err(error) => Err(error),
        };
        lock.release().await;

        response
    }

    /// Runs the handler and records its response under `cache_key`.
    async fn execute_and_record<F, Fut>(
        &self,
        policy: &IdempotencyPolicy,
        cache_key: &str,
        path: String,
        token: String,
        request: Request,
        next: F,
    ) -> Result<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        tracing::debug!(%cache_key, %path, "Executing request under idempotency lock");

        let (parts, body) = next(request).await.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::internal(format!("Failed to buffer response body: {e}")))?
            .to_bytes();

        match CachedResponse::from_response_parts(
            parts.status,
            &parts.headers,
            body.clone(),
            path,
            token,
        ) {
            Ok(cached) => {
                let payload = cached.encode()?;
                // The handler already ran, so a failed write only costs the replay.
                if let Err(error) = self.store.put(cache_key, payload, policy.cache_duration).await {
                    tracing::error!(%cache_key, %error, "Failed to record response");
                }
            }
            Err(error) => {
                tracing::warn!(%cache_key, %error, "Response cannot be recorded, returning it uncached");
            }
        }

        Ok(Response::from_parts(parts, Body::from(body)))
    }

    /// Builds the reply for a recorded response, or `None` if nothing is recorded.
    async fn replay_recorded(
        &self,
        policy: &IdempotencyPolicy,
        cache_key: &str,
        path: &str,
        token: &str,
    ) -> Result<Option<Response>> {
        if !self.store.has(cache_key).await? {
            return Ok(None);
        }
        let Some(payload) = self.store.get(cache_key).await? else {
            tracing::debug!(%cache_key, "Recorded response expired before it could be read");
            return Ok(None);
        };
        let cached = CachedResponse::decode(&payload)?;

        if cached.path() != path {
            return Err(Error::mismatched_path(format!(
                "Idempotency key previously used on different route ({}).",
                cached.path()
            ))
            .with_details(format!("idempotency_key={token}")));
        }

        if policy.behaviour == DuplicateBehaviour::Exception {
            tracing::warn!(%cache_key, %path, "Rejecting duplicate request");
            return Err(Error::duplicate_request("Duplicate request detected.")
                .with_details(format!("idempotency_key={token}")));
        }

        tracing::info!(%cache_key, %path, status = %cached.status(), "Replaying recorded response");
        cached.to_replay_response().map(Some)
    }

    /// Polls for the response of the request holding the lock.
    async fn wait_for_response(
        &self,
        policy: &IdempotencyPolicy,
        cache_key: &str,
        path: &str,
        token: &str,
    ) -> Result<Response> {
        for _ in 0..policy.max_poll_attempts() {
            if let Some(response) = self.replay_recorded(policy, cache_key, path, token).await? {
                return Ok(response);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let waited = policy.max_lock_wait_time.as_secs();
        tracing::warn!(%cache_key, waited_secs = waited, "Gave up waiting for in-flight request");
        Err(Error::lock_wait_exceeded(format!(
            "Lock wait time of {waited} seconds exceeded."
        ))
        .with_details(format!("idempotency_key={token}")))
    }
}

impl fmt::Debug for Idempotency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reloadable = matches!(self.config, ConfigSource::Watch(_));
        f.debug_struct("Idempotency")
            .field("reloadable", &reloadable)
            .field("resolvers", &self.resolvers)
            .finish_non_exhaustive()
    }
}

/// Reads the idempotency key. Missing and empty values count as absent.
///
/// Values that are not UTF-8 are kept as `b64:` followed by the base64 of
/// their raw bytes, so distinct keys stay distinct.
fn extract_token(request: &Request, header: &HeaderName) -> Option<String> {
    let raw = request.headers().get(header)?.as_bytes();
    if raw.is_empty() {
        return None;
    }
    Some(match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => format!("b64:{}", BASE64.encode(raw)),
    })
}

/// Execution lock that is released even if the request future panics or is
/// dropped before completing.
struct HeldLock {
    store: Arc<dyn IdempotencyStore>,
    lock_key: String,
    token: Option<LockToken>,
}

impl HeldLock {
    fn new(store: Arc<dyn IdempotencyStore>, lock_key: String, token: LockToken) -> Self {
        Self {
            store,
            lock_key,
            token: Some(token),
        }
    }

    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release_lock(self.store.clone(), std::mem::take(&mut self.lock_key), token).await;
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock_key = std::mem::take(&mut self.lock_key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%lock_key, "Request ended while holding idempotency lock, releasing");
                handle.spawn(release_lock(self.store.clone(), lock_key, token));
            }
            Err(_) => {
                tracing::error!(%lock_key, "No runtime to release idempotency lock, it will expire on its own");
            }
        }
    }
}

async fn release_lock(store: Arc<dyn IdempotencyStore>, lock_key: String, token: LockToken) {
    if let Err(error) = store.release(&lock_key, &token).await {
        tracing::error!(%lock_key, %error, "Failed to release idempotency lock");
    }
}

/// Middleware function for `axum::middleware::from_fn_with_state`.
///
/// ```rust
/// use axum::{Router, middleware, routing::post};
/// use axum_idempotency::{Idempotency, IdempotencyConfig, MemoryStore, idempotency_middleware};
///
/// let idempotency = Idempotency::new(IdempotencyConfig::default(), MemoryStore::new());
/// let app: Router = Router::new()
///     .route("/orders", post(|| async { "created" }))
///     .layer(middleware::from_fn_with_state(idempotency, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(idempotency): State<Idempotency>,
    request: Request,
    next: Next,
) -> Response {
    idempotency
        .handle(request, |request| next.run(request))
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Layer that applies the idempotency checks to a service.
#[derive(Clone, Debug)]
pub struct IdempotencyLayer {
    idempotency: Idempotency,
}

impl IdempotencyLayer {
    pub fn new(idempotency: Idempotency) -> Self {
        Self { idempotency }
    }
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            idempotency: self.idempotency.clone(),
        }
    }
}

/// Service produced by [`IdempotencyLayer`]. Errors are rendered as JSON
/// responses, so the service itself never fails.
#[derive(Clone, Debug)]
pub struct IdempotencyService<S> {
    inner: S,
    idempotency: Idempotency,
}

impl<S> Service<Request> for IdempotencyService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        let idempotency = self.idempotency.clone();

        Box::pin(async move {
            let response = idempotency
                .handle(request, |request| async move {
                    match inner.oneshot(request).await {
                        Ok(response) => response,
                        Err(never) => match never {},
                    }
                })
                .await
                .unwrap_or_else(IntoResponse::into_response);
            Ok(response)
        })
    }
}
