//! Idempotency policy configuration and its validator.
//!
//! [`IdempotencyConfig`] holds operator input exactly as written in TOML (or set
//! through the builder methods). The duplicate behaviour and the enforced verbs
//! stay plain strings there; [`IdempotencyConfig::validate`] turns the raw input
//! into a typed [`IdempotencyPolicy`] or fails with
//! [`ErrorKind::InvalidConfiguration`](crate::ErrorKind::InvalidConfiguration).
//!
//! The middleware validates the current snapshot on every request, so a
//! hot-reloaded configuration with a typo is rejected the moment it is used
//! rather than silently defaulted.

use {
    crate::{ActorResolver, Error, Result},
    http::{HeaderName, Method},
    serde::Deserialize,
    std::{fmt, str::FromStr, time::Duration},
};

/// HTTP methods accepted in `enforced_verbs`.
pub const VALID_VERBS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// What to do when a request reuses an idempotency key that already has a
/// cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateBehaviour {
    /// Send back the response recorded for the original request.
    #[default]
    Replay,
    /// Reject the duplicate with a `DUPLICATE_REQUEST` error.
    Exception,
}

impl DuplicateBehaviour {
    pub const ALL: [DuplicateBehaviour; 2] = [DuplicateBehaviour::Replay, DuplicateBehaviour::Exception];

    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateBehaviour::Replay => "replay",
            DuplicateBehaviour::Exception => "exception",
        }
    }
}

impl fmt::Display for DuplicateBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateBehaviour {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|behaviour| behaviour.as_str() == s)
            .ok_or_else(|| {
                let valid = Self::ALL.map(|b| b.as_str()).join(", ");
                Error::config(format!(
                    "Invalid idempotency duplicate behavior: '{s}'. Valid options are: {valid}"
                ))
            })
    }
}

/// Configuration for the idempotency middleware.
///
/// # Examples
///
/// In TOML configuration:
/// ```toml
/// [idempotency]
/// cache_duration = "1day"
/// idempotency_header = "Idempotency-Key"
/// on_duplicate_behaviour = "replay"   # or "exception"
/// ignore_empty_key = false
/// enforced_verbs = ["POST", "PUT", "PATCH", "DELETE"]
/// max_lock_wait_time = "10s"
/// lock_timeout = "60s"
/// user_id_resolver = ["TenantResolver", "current_tenant"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a recorded response stays replayable.
    /// Default: 1 day
    #[serde(
        default = "IdempotencyConfig::default_cache_duration",
        with = "humantime_serde"
    )]
    pub cache_duration: Duration,

    /// Request header carrying the client's idempotency key.
    /// Default: `Idempotency-Key`
    #[serde(default = "IdempotencyConfig::default_idempotency_header")]
    pub idempotency_header: String,

    /// `replay` sends the recorded response again, `exception` rejects the
    /// duplicate. Default: `replay`
    #[serde(default = "IdempotencyConfig::default_on_duplicate_behaviour")]
    pub on_duplicate_behaviour: String,

    /// When true, requests without a key pass through untouched instead of
    /// being rejected. Default: false
    #[serde(default)]
    pub ignore_empty_key: bool,

    /// Methods subject to idempotency checks. Everything else passes through.
    /// Default: POST, PUT, PATCH, DELETE
    #[serde(default = "IdempotencyConfig::default_enforced_verbs")]
    pub enforced_verbs: Vec<String>,

    /// Upper bound on how long a concurrent duplicate waits for the original
    /// request to finish. The cache is checked once per second, `secs - 1` times.
    /// Default: 10 seconds
    #[serde(
        default = "IdempotencyConfig::default_max_lock_wait_time",
        with = "humantime_serde"
    )]
    pub max_lock_wait_time: Duration,

    /// Expiry of the execution lock itself. Must outlive the slowest handler,
    /// otherwise a second executor can acquire the lock mid-flight.
    /// Default: 60 seconds
    #[serde(
        default = "IdempotencyConfig::default_lock_timeout",
        with = "humantime_serde"
    )]
    pub lock_timeout: Duration,

    /// Custom actor id resolution. When unset the `AuthenticatedActor`
    /// request extension is used, falling back to `"global"`.
    #[serde(default)]
    pub user_id_resolver: Option<ActorResolver>,
}

impl IdempotencyConfig {
    fn default_cache_duration() -> Duration {
        Duration::from_secs(86_400)
    }

    fn default_idempotency_header() -> String {
        "Idempotency-Key".into()
    }

    fn default_on_duplicate_behaviour() -> String {
        DuplicateBehaviour::Replay.as_str().into()
    }

    fn default_enforced_verbs() -> Vec<String> {
        ["POST", "PUT", "PATCH", "DELETE"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn default_max_lock_wait_time() -> Duration {
        Duration::from_secs(10)
    }

    fn default_lock_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    pub fn with_idempotency_header(mut self, header: impl Into<String>) -> Self {
        self.idempotency_header = header.into();
        self
    }

    pub fn with_duplicate_behaviour(mut self, behaviour: DuplicateBehaviour) -> Self {
        self.on_duplicate_behaviour = behaviour.as_str().into();
        self
    }

    pub fn with_ignore_empty_key(mut self, ignore: bool) -> Self {
        self.ignore_empty_key = ignore;
        self
    }

    pub fn with_enforced_verbs<I, V>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.enforced_verbs = verbs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_lock_wait_time(mut self, wait: Duration) -> Self {
        self.max_lock_wait_time = wait;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_user_id_resolver(mut self, resolver: ActorResolver) -> Self {
        self.user_id_resolver = Some(resolver);
        self
    }

    /// Checks the raw configuration and returns the typed policy the
    /// middleware runs with.
    ///
    /// Pure and side-effect free; calling it repeatedly on the same input
    /// always yields the same outcome.
    pub fn validate(&self) -> Result<IdempotencyPolicy> {
        let behaviour = self.on_duplicate_behaviour.parse::<DuplicateBehaviour>()?;

        let mut enforced_methods = Vec::with_capacity(self.enforced_verbs.len());
        for verb in &self.enforced_verbs {
            let upper = verb.to_ascii_uppercase();
            if !VALID_VERBS.contains(&upper.as_str()) {
                return Err(Error::config(format!(
                    "Invalid HTTP verb in enforced_verbs: '{verb}'. Valid verbs are: {}",
                    VALID_VERBS.join(", ")
                )));
            }
            let method = Method::from_bytes(upper.as_bytes())
                .map_err(|e| Error::config(format!("Invalid HTTP verb '{verb}': {e}")))?;
            enforced_methods.push(method);
        }

        if self.idempotency_header.trim().is_empty() {
            return Err(Error::config("idempotency_header cannot be empty."));
        }
        let header = HeaderName::from_bytes(self.idempotency_header.as_bytes()).map_err(|e| {
            Error::config(format!(
                "Invalid idempotency_header '{}': {e}",
                self.idempotency_header
            ))
        })?;

        if self.lock_timeout.is_zero() {
            return Err(Error::config("lock_timeout must be greater than zero."));
        }

        Ok(IdempotencyPolicy {
            header,
            header_label: self.idempotency_header.clone(),
            behaviour,
            enforced_methods,
            ignore_empty_key: self.ignore_empty_key,
            cache_duration: self.cache_duration,
            max_lock_wait_time: self.max_lock_wait_time,
            lock_timeout: self.lock_timeout,
            user_id_resolver: self.user_id_resolver.clone(),
        })
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cache_duration: Self::default_cache_duration(),
            idempotency_header: Self::default_idempotency_header(),
            on_duplicate_behaviour: Self::default_on_duplicate_behaviour(),
            ignore_empty_key: false,
            enforced_verbs: Self::default_enforced_verbs(),
            max_lock_wait_time: Self::default_max_lock_wait_time(),
            lock_timeout: Self::default_lock_timeout(),
            user_id_resolver: None,
        }
    }
}

/// Validated form of [`IdempotencyConfig`] used by the middleware for the
/// duration of one request.
#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    pub header: HeaderName,
    /// The header name as configured, for messages. `header` is lowercased.
    pub header_label: String,
    pub behaviour: DuplicateBehaviour,
    pub enforced_methods: Vec<Method>,
    pub ignore_empty_key: bool,
    pub cache_duration: Duration,
    pub max_lock_wait_time: Duration,
    pub lock_timeout: Duration,
    pub user_id_resolver: Option<ActorResolver>,
}

impl IdempotencyPolicy {
    /// Returns true if requests with this method go through the idempotency checks.
    pub fn enforces(&self, method: &Method) -> bool {
        self.enforced_methods.contains(method)
    }

    /// Number of one-second cache checks a contended request makes before
    /// giving up.
    pub fn max_poll_attempts(&self) -> u64 {
        self.max_lock_wait_time.as_secs().saturating_sub(1)
    }
}
