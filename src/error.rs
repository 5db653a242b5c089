//! Error types shared across the control plane.
//!
//! One enum per subsystem, returned as explicit `Result`s, never as
//! exception-style control flow. The closed failure sets let callers switch
//! on the reason (e.g. map `AlreadyClaimed` to a 409 while retrying
//! `LookupUnavailable`).

use thiserror::Error;

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required configuration '{key}': {hint}")]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// An environment variable is present but unparseable.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// An environment variable is not valid unicode.
    #[error("Configuration '{key}' is not valid unicode")]
    NotUnicode {
        /// Environment variable name.
        key: String,
    },
}

/// Transport and protocol failures talking to the payment provider.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The provider rejected the call (4xx).
    #[error("Payment provider rejected the request (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status returned by the provider.
        status: u16,
        /// Human-readable summary.
        message: String,
        /// Raw provider body for diagnostics.
        body: serde_json::Value,
    },

    /// The provider is unreachable or failing (5xx / connect / timeout).
    #[error("Payment provider unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure.
        reason: String,
    },

    /// The provider responded but the body was not the expected shape.
    #[error("Invalid payment provider response: {reason}")]
    InvalidResponse {
        /// Why parsing failed.
        reason: String,
    },
}

/// Failures admitting a metered tool call.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Only one settlement currency is accepted.
    #[error("Unsupported payment currency '{currency}', only USDC is accepted")]
    UnsupportedCurrency {
        /// The currency the caller asked for.
        currency: String,
    },

    /// The metered path requires an explicit tool selection.
    #[error("Metered execution requires an explicit tool name")]
    MissingTool,

    /// Free-form query input cannot be priced; only direct tool calls are metered.
    #[error("Metered execution does not support free-form query input")]
    QueryNotSupported,

    /// The request id is unknown (never created here, or already purged).
    #[error("Invalid or expired payment request id")]
    UnknownRequestId,

    /// The context outlived its TTL and was purged.
    #[error("Payment request id expired")]
    Expired,

    /// The charge was already spent on an execution.
    #[error("Payment request id was already consumed")]
    Consumed,

    /// The request id belongs to a different payer or agent.
    #[error("Payment request id does not match user or agent")]
    IdentityMismatch,

    /// The tool call payload differs from the one the charge was bound to.
    #[error("Payment request id payload mismatch")]
    PayloadMismatch,

    /// Provider-side failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Failures from the provider signup passthroughs.
#[derive(Debug, Error)]
pub enum SignupError {
    /// This client IP already signed up within the rate-limit window.
    #[error("Too many signup requests from this IP. Try again in {retry_after_secs} seconds.")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// Password fails the provider's strength policy.
    #[error("Weak password: {reason}")]
    WeakPassword {
        /// Which rule was violated.
        reason: String,
    },

    /// Provider-side failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Failures from the transactional claim store.
///
/// `AlreadyClaimed` and `InvalidOrExpiredCode` are condition-failure
/// outcomes of the atomic claim transaction, not transport errors.
#[derive(Debug, Error)]
pub enum ClaimStoreError {
    /// Store unreachable or tables inaccessible. Claims fail closed.
    #[error("Claim store unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure.
        reason: String,
    },

    /// The handle-uniqueness condition failed inside the transaction.
    #[error("Handle already claimed")]
    AlreadyClaimed,

    /// The verification-code condition failed inside the transaction.
    #[error("Invalid or expired verification code")]
    InvalidOrExpiredCode,

    /// Any other store failure.
    #[error("Claim store operation failed: {reason}")]
    Internal {
        /// Reason for the failure.
        reason: String,
    },
}

/// Failures fetching a social post from a lookup source.
#[derive(Debug, Error)]
pub enum PostLookupError {
    /// The source authoritatively reported the post does not exist.
    #[error("Post not found")]
    NotFound,

    /// Timeout, 5xx, or malformed response: retryable, never authoritative.
    #[error("Post lookup source unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure.
        reason: String,
    },
}

/// Failures redeeming a one-time claim.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The post URL is not a recognized status link.
    #[error("Invalid post URL format")]
    InvalidPostUrl,

    /// The verification code is missing, consumed, or past its TTL.
    #[error("Invalid or expired verification code")]
    InvalidOrExpiredCode,

    /// The handle already redeemed its one-time reward.
    #[error("This account has already claimed credits")]
    AlreadyClaimed,

    /// The post does not mention the service handle.
    #[error("Post does not contain the required claim text")]
    MissingClaimText,

    /// The post does not carry the exact verification code.
    #[error("Post does not contain the verification code")]
    MissingVerificationCode,

    /// Every configured lookup source confirmed the post does not exist.
    #[error("Post not found")]
    PostNotFound,

    /// At least one lookup source failed for a non-404 reason.
    #[error("Post verification service unavailable: {reason}")]
    LookupUnavailable {
        /// Reason for the failure.
        reason: String,
    },

    /// The claim store is unreachable; the claim fails closed.
    #[error("Claim service unavailable: {reason}")]
    StoreUnavailable {
        /// Reason for the failure.
        reason: String,
    },

    /// The claim transaction failed for a reason other than its conditions.
    #[error("Unable to complete claim: {reason}")]
    Internal {
        /// Reason for the failure.
        reason: String,
    },
}

impl From<ClaimStoreError> for ClaimError {
    fn from(err: ClaimStoreError) -> Self {
        match err {
            ClaimStoreError::Unavailable { reason } => ClaimError::StoreUnavailable { reason },
            ClaimStoreError::AlreadyClaimed => ClaimError::AlreadyClaimed,
            ClaimStoreError::InvalidOrExpiredCode => ClaimError::InvalidOrExpiredCode,
            ClaimStoreError::Internal { reason } => ClaimError::Internal { reason },
        }
    }
}

/// Failures forwarding a call through the standby relay pool.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Proxy failover is not enabled.
    #[error("Proxy fallback is not enabled")]
    Disabled,

    /// No relay servers configured.
    #[error("No proxy servers configured")]
    NoServers,

    /// The shared relay bearer secret is missing.
    #[error("Proxy auth key is not configured")]
    MissingAuthKey,

    /// Every relay in the rotation failed.
    #[error("All {attempted} proxy servers failed: {}", errors.join("; "))]
    AllServersFailed {
        /// How many relays were tried.
        attempted: usize,
        /// One error string per relay, in attempt order.
        errors: Vec<String>,
    },
}
