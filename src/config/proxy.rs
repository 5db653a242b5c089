use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, split_env_list};
use crate::error::ConfigError;

const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;

/// Standby relay pool configuration for proxy failover.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Master switch; the client refuses all forwarding when off.
    pub enabled: bool,
    /// Relay base URLs, tried in round-robin order.
    pub servers: Vec<String>,
    /// Shared bearer secret presented to every relay.
    pub auth_key: Option<SecretString>,
    /// Per-forwarding-call timeout.
    pub timeout: Duration,
}

impl ProxyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let enabled = parse_bool_env("PROXY_ENABLED", false)?;

        let servers = optional_env("PROXY_SERVERS")?
            .map(|raw| split_env_list(&raw))
            .unwrap_or_default();
        for server in &servers {
            url::Url::parse(server).map_err(|e| ConfigError::InvalidValue {
                key: "PROXY_SERVERS".to_string(),
                message: format!("'{server}' is not a valid URL: {e}"),
            })?;
        }

        let auth_key = optional_env("PROXY_AUTH_KEY")?.map(SecretString::from);

        let timeout = Duration::from_secs(parse_optional_env(
            "PROXY_TIMEOUT_SECONDS",
            DEFAULT_PROXY_TIMEOUT_SECS,
        )?);

        if enabled && servers.is_empty() {
            tracing::warn!("proxy failover enabled but no servers configured");
        }

        Ok(Self {
            enabled,
            servers,
            auth_key,
            timeout,
        })
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: Vec::new(),
            auth_key: None,
            timeout: Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
        }
    }
}
