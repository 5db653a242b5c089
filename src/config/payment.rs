use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{parse_optional_env, require_env};
use crate::error::ConfigError;

const DEFAULT_CONTEXT_TTL_SECS: u64 = 1800;
const DEFAULT_SIGNUP_RATE_LIMIT_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Payment provider configuration.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Provider REST base URL (no trailing slash).
    pub base_url: String,
    /// Service API key sent as `X-API-Key`.
    pub api_key: SecretString,
    /// How long a pending payment context may be polled before it is purged.
    pub context_ttl: Duration,
    /// Minimum gap between signups from one client IP.
    pub signup_rate_limit_window: Duration,
    /// Per-call HTTP timeout against the provider.
    pub request_timeout: Duration,
}

impl PaymentConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let base_url = require_env(
            "PAYMENT_BASE_URL",
            "Set PAYMENT_BASE_URL to the payment provider's REST endpoint",
        )?
        .trim_end_matches('/')
        .to_string();

        let api_key = SecretString::from(require_env(
            "PAYMENT_API_KEY",
            "Set PAYMENT_API_KEY to the provider-issued service key",
        )?);

        // A zero or negative TTL would purge contexts before the first poll;
        // fall back to the default instead of refusing to start.
        let ttl_secs: i64 =
            parse_optional_env("PAYMENT_CONTEXT_TTL_SECONDS", DEFAULT_CONTEXT_TTL_SECS as i64)?;
        let context_ttl = if ttl_secs > 0 {
            Duration::from_secs(ttl_secs as u64)
        } else {
            Duration::from_secs(DEFAULT_CONTEXT_TTL_SECS)
        };

        let window_secs: i64 = parse_optional_env(
            "PAYMENT_SIGNUP_IP_RATE_LIMIT_SECONDS",
            DEFAULT_SIGNUP_RATE_LIMIT_SECS as i64,
        )?;
        let signup_rate_limit_window = if window_secs > 0 {
            Duration::from_secs(window_secs as u64)
        } else {
            Duration::from_secs(DEFAULT_SIGNUP_RATE_LIMIT_SECS)
        };

        let request_timeout = Duration::from_secs(parse_optional_env(
            "PAYMENT_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        Ok(Self {
            base_url,
            api_key,
            context_ttl,
            signup_rate_limit_window,
            request_timeout,
        })
    }

    /// Get the provider API key (exposes the secret).
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}
