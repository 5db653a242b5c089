//! Environment-driven configuration.
//!
//! Each subsystem gets its own config struct with a `resolve()` that reads
//! the environment once at startup; [`Config::from_env`] aggregates them.
//! [`Config::load`] additionally honors a `.env` file in the working
//! directory; `from_env` never loads one implicitly.

mod claim;
mod helpers;
mod payment;
mod proxy;

pub use claim::ClaimConfig;
pub use payment::PaymentConfig;
pub use proxy::ProxyConfig;

pub(crate) use helpers::{optional_env, split_env_list};

use crate::error::ConfigError;

/// Aggregated control-plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub payment: PaymentConfig,
    pub claim: ClaimConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    /// Load a `.env` file if present, then resolve from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Resolve all subsystem configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            payment: PaymentConfig::resolve()?,
            claim: ClaimConfig::resolve()?,
            proxy: ProxyConfig::resolve()?,
        })
    }
}
