//!
//! Helpers shared by configuration loading.
//!

use {
    regex::{Captures, Regex},
    std::{env, sync::LazyLock},
};

/// Matches `{{ VAR_NAME }}` with optional whitespace inside the braces.
/// Names follow the usual env var convention: uppercase letters, digits, underscores.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Z0-9_]+)\s*\}\}").unwrap());

/// Replaces `{{ VAR_NAME }}` placeholders with the value of the environment
/// variable of the same name.
///
/// Unset variables become empty strings and are reported with a warning, so a
/// config file can keep key names and other deployment-specific values out of
/// version control:
///
/// ```
/// use axum_idempotency::substitute_env_placeholders;
///
/// let text = substitute_env_placeholders("idempotency_header = \"{{ UNSET_HEADER_VAR }}\"");
/// assert_eq!(text, "idempotency_header = \"\"");
/// ```
pub fn substitute_env_placeholders(input: &str) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            env::var(name).unwrap_or_else(|_| {
                tracing::warn!(
                    variable = %name,
                    "Environment variable not found, substituting with empty string"
                );
                String::new()
            })
        })
        .into_owned()
}
