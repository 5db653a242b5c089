use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

const DEFAULT_VERIFICATION_TTL_SECS: u64 = 600;
const DEFAULT_FREE_CREDITS: u32 = 100;
const DEFAULT_SERVICE_HANDLE: &str = "@heurist_ai";
const DEFAULT_PRIMARY_LOOKUP_BASE_URL: &str = "https://api.fxtwitter.com";
const DEFAULT_SECONDARY_LOOKUP_BASE_URL: &str = "https://api.apidance.pro";

/// Claim ledger configuration.
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// How long a verification code stays redeemable.
    pub verification_ttl: Duration,
    /// Credits granted by a successful claim.
    pub free_credits: u32,
    /// The service handle the claim post must mention (e.g. `@heurist_ai`).
    pub service_handle: String,
    /// Base URL of the primary (public) post lookup source.
    pub primary_lookup_base_url: String,
    /// Base URL of the secondary (keyed) post lookup source.
    pub secondary_lookup_base_url: String,
    /// API key for the secondary lookup source; the secondary is skipped
    /// entirely when unset.
    pub secondary_lookup_api_key: Option<SecretString>,
}

impl ClaimConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let ttl_secs: i64 = parse_optional_env(
            "CLAIM_VERIFICATION_TTL_SECONDS",
            DEFAULT_VERIFICATION_TTL_SECS as i64,
        )?;
        let verification_ttl = if ttl_secs > 0 {
            Duration::from_secs(ttl_secs as u64)
        } else {
            Duration::from_secs(DEFAULT_VERIFICATION_TTL_SECS)
        };

        let free_credits = parse_optional_env("CLAIM_FREE_CREDITS", DEFAULT_FREE_CREDITS)?;

        let service_handle = optional_env("CLAIM_SERVICE_HANDLE")?
            .unwrap_or_else(|| DEFAULT_SERVICE_HANDLE.to_string())
            .to_lowercase();

        let primary_lookup_base_url = optional_env("CLAIM_PRIMARY_LOOKUP_URL")?
            .unwrap_or_else(|| DEFAULT_PRIMARY_LOOKUP_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let secondary_lookup_base_url = optional_env("CLAIM_SECONDARY_LOOKUP_URL")?
            .unwrap_or_else(|| DEFAULT_SECONDARY_LOOKUP_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let secondary_lookup_api_key =
            optional_env("CLAIM_SECONDARY_LOOKUP_API_KEY")?.map(SecretString::from);

        Ok(Self {
            verification_ttl,
            free_credits,
            service_handle,
            primary_lookup_base_url,
            secondary_lookup_base_url,
            secondary_lookup_api_key,
        })
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            verification_ttl: Duration::from_secs(DEFAULT_VERIFICATION_TTL_SECS),
            free_credits: DEFAULT_FREE_CREDITS,
            service_handle: DEFAULT_SERVICE_HANDLE.to_string(),
            primary_lookup_base_url: DEFAULT_PRIMARY_LOOKUP_BASE_URL.to_string(),
            secondary_lookup_base_url: DEFAULT_SECONDARY_LOOKUP_BASE_URL.to_string(),
            secondary_lookup_api_key: None,
        }
    }
}
