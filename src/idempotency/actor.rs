//! Actor resolution: which caller a cached response belongs to.
//!
//! The actor id scopes every cache key, so two callers sending the same
//! idempotency key never see each other's responses. It is resolved, in order:
//!
//! 1. from the configured [`ActorResolver`], if any: either a callback set
//!    programmatically, or a `[service, method]` reference from TOML looked up
//!    in the [`ResolverRegistry`] the application registered;
//! 2. otherwise from the [`AuthenticatedActor`] request extension inserted by
//!    the authentication layer;
//! 3. otherwise the shared [`GLOBAL_ACTOR`].

use {
    crate::{Error, Result},
    axum::extract::Request,
    serde::{Deserialize, Deserializer},
    std::{collections::HashMap, fmt, sync::Arc},
};

/// Actor id used when no identity can be resolved.
pub const GLOBAL_ACTOR: &str = "global";

/// Identity of the authenticated caller.
///
/// Authentication middleware inserts this into the request extensions; the
/// idempotency layer must run after it.
///
/// ```rust
/// use axum::{body::Body, extract::Request};
/// use axum_idempotency::AuthenticatedActor;
///
/// let mut request = Request::new(Body::empty());
/// request.extensions_mut().insert(AuthenticatedActor::new("user-42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedActor(pub String);

impl AuthenticatedActor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Signature shared by callback and registered resolvers.
pub type ResolveFn = dyn Fn(&Request) -> Option<String> + Send + Sync;

/// A `[service, method]` pair naming a resolver in the [`ResolverRegistry`].
///
/// Written in TOML as a two element array:
/// ```toml
/// user_id_resolver = ["TenantResolver", "current_tenant"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ResolverRef(String, String);

impl ResolverRef {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self(service.into(), method.into())
    }

    pub fn service(&self) -> &str {
        &self.0
    }

    pub fn method(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for ResolverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.0, self.1)
    }
}

/// Strategy for computing the actor id of a request.
#[derive(Clone)]
pub enum ActorResolver {
    /// Computes the id directly.
    Callback(Arc<ResolveFn>),
    /// Names a resolver registered in the [`ResolverRegistry`]. This is the
    /// only form that can be written in a configuration file.
    Reference(ResolverRef),
}

impl ActorResolver {
    /// Wraps a closure as a resolver.
    ///
    /// ```rust
    /// use axum_idempotency::ActorResolver;
    ///
    /// let resolver = ActorResolver::callback(|request| {
    ///     request
    ///         .headers()
    ///         .get("x-tenant-id")
    ///         .and_then(|v| v.to_str().ok())
    ///         .map(String::from)
    /// });
    /// ```
    pub fn callback<F>(resolve: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(resolve))
    }

    pub fn reference(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Reference(ResolverRef::new(service, method))
    }
}

impl fmt::Debug for ActorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorResolver::Callback(_) => f.write_str("Callback(..)"),
            ActorResolver::Reference(reference) => {
                f.debug_tuple("Reference").field(reference).finish()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ActorResolver {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        ResolverRef::deserialize(deserializer).map(ActorResolver::Reference)
    }
}

/// Resolvers the application makes available to `[service, method]`
/// references in configuration.
///
/// ```rust
/// use axum_idempotency::ResolverRegistry;
///
/// let registry = ResolverRegistry::new().register("TenantResolver", "current_tenant", |request| {
///     request
///         .headers()
///         .get("x-tenant-id")
///         .and_then(|v| v.to_str().ok())
///         .map(String::from)
/// });
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<ResolverRef, Arc<ResolveFn>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resolve` under `service::method`, replacing any previous entry.
    pub fn register<F>(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        resolve: F,
    ) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.resolvers
            .insert(ResolverRef::new(service, method), Arc::new(resolve));
        self
    }

    pub fn get(&self, reference: &ResolverRef) -> Option<&Arc<ResolveFn>> {
        self.resolvers.get(reference)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}

/// Computes the actor id for `request`.
///
/// Fails only when a reference names a resolver that was never registered.
pub(crate) fn resolve_actor(
    resolver: Option<&ActorResolver>,
    registry: &ResolverRegistry,
    request: &Request,
) -> Result<String> {
    let resolved = match resolver {
        Some(ActorResolver::Callback(resolve)) => resolve(request),
        Some(ActorResolver::Reference(reference)) => {
            let resolve = registry.get(reference).ok_or_else(|| {
                Error::config(format!("User id resolver {reference} is not registered."))
            })?;
            resolve(request)
        }
        None => request
            .extensions()
            .get::<AuthenticatedActor>()
            .map(|actor| actor.0.clone()),
    };

    Ok(resolved
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| GLOBAL_ACTOR.to_string()))
}
