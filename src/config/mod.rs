//!
//! Configuration structures and loading.
//!
//! A configuration can be created in several ways:
//! - From an environment-specific TOML file via `Config::from_rust_env` or `Config::from_toml_file`
//! - From a TOML string via `Config::from_toml` or `str::parse`
//! - Constructed programmatically via the builder methods on `Config` and `IdempotencyConfig`
//!
//! TOML input may reference environment variables with the `{{ VAR_NAME }}`
//! syntax; they are substituted before parsing (see `substitute_env_placeholders`).
//!
//! Sections:
//!
//! - `IdempotencyConfig` for the middleware policy (`[idempotency]`)
//! - `LoggingConfig` for log output (`[logging]`)
//!
mod idempotency;
mod logging;

pub use idempotency::*;
pub use logging::*;

use {
    crate::{Error, Result, utils::substitute_env_placeholders},
    serde::Deserialize,
    std::{env, fs, str::FromStr, time::Duration},
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    ///
    /// Loads the configuration for the current RUST_ENV from "config/{env}.toml",
    /// falling back to built-in defaults when the variable is unset or the file
    /// cannot be loaded.
    ///
    fn default() -> Self {
        match Self::from_rust_env() {
            Ok(config) => config,
            Err(_) => Config {
                idempotency: IdempotencyConfig::default(),
                logging: LoggingConfig::default(),
            },
        }
    }
}

impl Config {
    ///
    /// Loads the configuration from a file based on the RUST_ENV environment variable.
    ///
    pub fn from_rust_env() -> Result<Config> {
        Self::from_toml_file(env::var("RUST_ENV")?)
    }

    ///
    /// Given an environment name, loads "config/{env}.toml", substitutes any
    /// environment variables, and parses the result.
    ///
    pub fn from_toml_file(env: impl AsRef<str>) -> Result<Config> {
        let path = format!("config/{}.toml", env.as_ref());
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    ///
    /// Parses a configuration string in TOML format into a Config struct.
    ///
    pub fn from_toml(toml_str: &str) -> Result<Config> {
        toml_str.parse()
    }

    /// Sets the duration recorded responses stay replayable.
    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.idempotency.cache_duration = duration;
        self
    }

    /// Sets the header carrying the idempotency key.
    pub fn with_idempotency_header(mut self, header: impl Into<String>) -> Self {
        self.idempotency.idempotency_header = header.into();
        self
    }

    /// Sets the duplicate behaviour.
    pub fn with_duplicate_behaviour(mut self, behaviour: DuplicateBehaviour) -> Self {
        self.idempotency = self.idempotency.with_duplicate_behaviour(behaviour);
        self
    }

    /// Sets the methods subject to idempotency checks.
    pub fn with_enforced_verbs<I, V>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.idempotency = self.idempotency.with_enforced_verbs(verbs);
        self
    }

    /// Sets the maximum time a concurrent duplicate waits for the original.
    pub fn with_max_lock_wait_time(mut self, wait: Duration) -> Self {
        self.idempotency.max_lock_wait_time = wait;
        self
    }

    /// Sets the log format of the LoggingConfig.
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.logging.format = format;
        self
    }

    /// Ensures that every section of the configuration is valid.
    pub fn validate(&self) -> Result<()> {
        self.idempotency.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    ///
    /// Sets up the tracing subscriber for logging based on the LoggingConfig.
    ///
    /// NOTE: This should be called early during startup to ensure logging is configured
    ///       before any log messages are emitted.
    ///
    pub fn setup_tracing(&self) {
        use tracing_subscriber::{EnvFilter, prelude::*};
        let env_filter = EnvFilter::from_default_env();
        match self.logging.format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().json())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Default => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Compact => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().compact())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .with(env_filter)
                    .try_init();
            }
        }
    }
}

impl FromStr for Config {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let text = substitute_env_placeholders(s);
        let config = toml::from_str::<Config>(&text)?;
        Ok(config)
    }
}
