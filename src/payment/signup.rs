//! Provider account signup passthroughs.
//!
//! Two thin operations against the payment provider: creating a bare agentic
//! user, and attaching real login details to one. Signups are rate-limited
//! per client IP so a single host cannot mint accounts in a loop. The
//! limiter is in-memory with lazy cleanup; limits reset on process restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::PaymentConfig;
use crate::error::SignupError;
use crate::payment::provider::{AttachDetails, PaymentGateway};

const MIN_PASSWORD_LEN: usize = 10;

/// One-signup-per-window limiter keyed by client IP.
pub struct SignupRateLimiter {
    window: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl SignupRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt from `client_ip`, rejecting it when the previous
    /// attempt is still inside the window.
    pub async fn check_and_record(&self, client_ip: &str) -> Result<(), SignupError> {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().await;
        last_seen.retain(|_, at| now.duration_since(*at) < self.window);

        if let Some(at) = last_seen.get(client_ip) {
            let elapsed = now.duration_since(*at);
            // retain() left it in the map, so elapsed < window holds.
            let retry_after_secs = (self.window - elapsed).as_secs();
            return Err(SignupError::RateLimited { retry_after_secs });
        }

        last_seen.insert(client_ip.to_string(), now);
        Ok(())
    }
}

/// Derive the originating client IP the way a proxied deployment sees it:
/// first entry of `X-Forwarded-For` when present, otherwise the socket peer.
pub fn client_ip_from_forwarded(x_forwarded_for: Option<&str>, peer_addr: Option<&str>) -> String {
    if let Some(forwarded) = x_forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer_addr
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Provider signup flow with IP rate limiting and password policy.
pub struct SignupService {
    gateway: Arc<dyn PaymentGateway>,
    limiter: SignupRateLimiter,
}

impl SignupService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, config: &PaymentConfig) -> Self {
        Self {
            gateway,
            limiter: SignupRateLimiter::new(config.signup_rate_limit_window),
        }
    }

    /// Create a bare agentic user for the calling client.
    pub async fn signup(
        &self,
        client_ip: &str,
        locale: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Value, SignupError> {
        self.limiter.check_and_record(client_ip).await?;
        let body = self.gateway.signup_agentic_user(locale, timezone).await?;
        tracing::info!(client_ip, "created agentic user");
        Ok(body)
    }

    /// Attach login details to an agentic user. Authenticated with the
    /// user's own private key; not rate-limited (the key itself gates it).
    pub async fn attach(
        &self,
        private_key: &str,
        details: &AttachDetails,
    ) -> Result<Value, SignupError> {
        validate_attach_password(&details.password)?;
        Ok(self.gateway.attach_agentic_user(private_key, details).await?)
    }
}

/// Provider password policy: length plus all four character classes.
pub fn validate_attach_password(password: &str) -> Result<(), SignupError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(SignupError::WeakPassword {
            reason: format!("must be at least {MIN_PASSWORD_LEN} characters"),
        });
    }
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_alphanumeric());
    if !(has_upper && has_lower && has_digit && has_symbol) {
        return Err(SignupError::WeakPassword {
            reason: "must include uppercase, lowercase, number, and symbol".to_string(),
        });
    }
    Ok(())
}
