//! Credential rotation for outbound APIs.
//!
//! Holds N equivalent secrets for one API and rotates between them, either
//! when a request fails with a rotate-worthy error or on a fixed interval.
//! Errors like 404/422 are not fixed by switching credentials, so they are
//! surfaced unchanged instead of burning the rest of the pool.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{optional_env, split_env_list};
use crate::error::ConfigError;

const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// Error substrings that rotation cannot fix.
const DEFAULT_NON_ROTATABLE_ERRORS: &[&str] = &["500", "404", "422", "not found", "unprocessable"];

/// When the pool advances its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMode {
    /// Rotate when a request fails with a rotate-worthy error.
    #[default]
    ErrorDriven,
    /// Rotate whenever the configured interval has elapsed.
    TimeDriven,
}

type HeaderBuilder = Box<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;

struct PoolState {
    current_index: usize,
    last_rotation: Instant,
}

/// Rotating pool of equivalent API credentials.
///
/// The starting index is chosen uniformly at random so that a fleet of
/// processes booting together spreads load across the pool instead of all
/// hammering key zero.
pub struct CredentialPool {
    keys: Vec<String>,
    mode: RotationMode,
    rotation_interval: Duration,
    non_rotatable_errors: Vec<String>,
    header_builder: HeaderBuilder,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>) -> Result<Self, ConfigError> {
        if keys.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "api_keys".to_string(),
                message: "credential pool requires at least one key".to_string(),
            });
        }

        let start = rand::thread_rng().gen_range(0..keys.len());
        tracing::info!(
            keys = keys.len(),
            start_index = start,
            key = %mask_key(&keys[start]),
            "credential pool initialized"
        );

        Ok(Self {
            keys,
            mode: RotationMode::default(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            non_rotatable_errors: DEFAULT_NON_ROTATABLE_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            header_builder: Box::new(default_header_builder),
            state: Mutex::new(PoolState {
                current_index: start,
                last_rotation: Instant::now(),
            }),
        })
    }

    /// Build a pool from a comma-separated environment variable.
    pub fn from_env(env_var: &str) -> Result<Self, ConfigError> {
        let raw = optional_env(env_var)?.ok_or_else(|| ConfigError::MissingRequired {
            key: env_var.to_string(),
            hint: "set it to a comma-separated list of API keys".to_string(),
        })?;
        let keys = split_env_list(&raw);
        if keys.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: env_var.to_string(),
                message: "no valid API keys found".to_string(),
            });
        }
        Self::new(keys)
    }

    pub fn with_mode(mut self, mode: RotationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Replace the non-rotatable error substrings (matched case-insensitively).
    pub fn with_non_rotatable_errors(mut self, patterns: Vec<String>) -> Self {
        self.non_rotatable_errors = patterns;
        self
    }

    /// Replace the header builder (default: JSON content type + bearer auth).
    pub fn with_header_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.header_builder = Box::new(builder);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Index of the active credential (mainly for logging and tests).
    pub fn current_index(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").current_index
    }

    /// Headers for the active credential. In time-driven mode this is also
    /// the rotation point: the cursor advances when the interval elapsed.
    pub fn current_headers(&self) -> Vec<(String, String)> {
        if self.mode == RotationMode::TimeDriven {
            self.rotate_if_time_elapsed();
        }
        let index = self.current_index();
        (self.header_builder)(&self.keys[index])
    }

    /// Does this error justify trying the next credential?
    pub fn should_rotate_on_error(&self, error_msg: &str) -> bool {
        let lower = error_msg.to_lowercase();
        !self
            .non_rotatable_errors
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// Rotate in response to an error. Returns whether a rotation happened.
    pub fn rotate_on_error(&self, error_msg: &str) -> bool {
        if !self.should_rotate_on_error(error_msg) {
            tracing::error!(error = error_msg, "non-rotatable error");
            return false;
        }
        tracing::warn!(error = error_msg, "rotatable error, switching credential");
        self.rotate()
    }

    /// Time-mode rotation. Check and advance happen under one lock hold so
    /// concurrent callers observing the same elapsed interval rotate once,
    /// not once each.
    fn rotate_if_time_elapsed(&self) -> bool {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if state.last_rotation.elapsed() >= self.rotation_interval {
            self.advance(&mut state)
        } else {
            false
        }
    }

    /// Advance the cursor to the next credential.
    fn rotate(&self) -> bool {
        let mut state = self.state.lock().expect("pool lock poisoned");
        self.advance(&mut state)
    }

    fn advance(&self, state: &mut PoolState) -> bool {
        if self.keys.len() <= 1 {
            tracing::warn!("only one credential available, cannot rotate");
            return false;
        }

        let previous = state.current_index;
        state.current_index = (state.current_index + 1) % self.keys.len();
        state.last_rotation = Instant::now();
        tracing::info!(
            from = previous,
            to = state.current_index,
            key = %mask_key(&self.keys[state.current_index]),
            "rotated credential"
        );
        true
    }

    /// Run a request with automatic rotation: at most one attempt per
    /// credential (one pass over the pool), stopping early on success or on
    /// a non-rotatable error, and returning the last error when every
    /// credential is exhausted.
    pub async fn execute_with_rotation<T, E, F, Fut>(&self, mut request: F) -> Result<T, E>
    where
        F: FnMut(Vec<(String, String)>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let total = self.keys.len();

        let mut last_err = match request(self.current_headers()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        for _ in 1..total {
            if !self.should_rotate_on_error(&last_err.to_string()) {
                tracing::error!(error = %last_err, "non-rotatable error, giving up");
                return Err(last_err);
            }
            tracing::warn!(error = %last_err, "rotatable error, trying next credential");
            if !self.rotate() {
                return Err(last_err);
            }

            match request(self.current_headers()).await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = err,
            }
        }

        tracing::error!(keys = total, "all credentials exhausted");
        Err(last_err)
    }
}

fn default_header_builder(api_key: &str) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Authorization".to_string(), format!("Bearer {api_key}")),
    ]
}

/// Mask a key for safe logging. Counts characters, not bytes, so keys with
/// multibyte content never split mid-character.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}...{suffix}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::new((0..n).map(|i| format!("credential-key-{i}")).collect()).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(CredentialPool::new(Vec::new()).is_err());
    }

    #[test]
    fn default_headers_carry_bearer_auth() {
        let pool = pool(1);
        let headers = pool.current_headers();
        assert_eq!(headers[0].0, "Content-Type");
        assert_eq!(headers[1].1, "Bearer credential-key-0");
    }

    #[test]
    fn non_rotatable_patterns_are_case_insensitive() {
        let pool = pool(3);
        assert!(!pool.should_rotate_on_error("HTTP 404 Not Found"));
        assert!(!pool.should_rotate_on_error("Unprocessable entity"));
        assert!(pool.should_rotate_on_error("HTTP 429 rate limited"));
    }

    #[test]
    fn rotate_on_error_advances_only_for_rotatable() {
        let pool = pool(3);
        let before = pool.current_index();

        assert!(!pool.rotate_on_error("404 not found"));
        assert_eq!(pool.current_index(), before);

        assert!(pool.rotate_on_error("429 too many requests"));
        assert_eq!(pool.current_index(), (before + 1) % 3);
    }

    #[test]
    fn single_key_pool_cannot_rotate() {
        let pool = pool(1);
        assert!(!pool.rotate_on_error("429 too many requests"));
    }

    #[test]
    fn time_mode_rotates_after_interval() {
        let pool = pool(2)
            .with_mode(RotationMode::TimeDriven)
            .with_rotation_interval(Duration::ZERO);
        let before = pool.current_index();
        pool.current_headers();
        assert_eq!(pool.current_index(), (before + 1) % 2);
    }

    #[test]
    fn elapsed_interval_rotates_once_across_threads() {
        let pool = pool(2)
            .with_mode(RotationMode::TimeDriven)
            .with_rotation_interval(Duration::from_millis(30));
        let before = pool.current_index();
        std::thread::sleep(Duration::from_millis(50));

        // Every thread sees the interval elapsed; with a 2-key pool a double
        // rotation would land back on the starting index.
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    pool.current_headers();
                });
            }
        });
        assert_eq!(pool.current_index(), (before + 1) % 2);
    }

    #[test]
    fn mask_key_hides_short_and_long_keys() {
        assert_eq!(mask_key("short"), "****");
        assert_eq!(mask_key("abcdefghijklmnop"), "abcd...mnop");
    }

    #[test]
    fn mask_key_handles_multibyte_keys() {
        // 5 chars but 10 bytes; must mask fully, not slice mid-character.
        assert_eq!(mask_key("ééééé"), "****");
        assert_eq!(mask_key("ключ-секрет-123"), "ключ...-123");
    }

    #[tokio::test]
    async fn exhaustion_tries_each_credential_once() {
        let pool = pool(3);
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = pool
            .execute_with_rotation(|_headers| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("429 rate limited".to_string()) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "429 rate limited");
    }

    #[tokio::test]
    async fn non_rotatable_error_stops_immediately() {
        let pool = pool(3);
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = pool
            .execute_with_rotation(|_headers| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("429 rate limited".to_string())
                    } else {
                        Err("404 not found".to_string())
                    }
                }
            })
            .await;

        // Attempt 1 rotates, attempt 2 hits a non-rotatable error, and the
        // third credential is never tried.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap_err(), "404 not found");
    }

    #[tokio::test]
    async fn success_after_rotation_returns_early() {
        let pool = pool(3);
        let attempts = AtomicU32::new(0);

        let result: Result<&'static str, String> = pool
            .execute_with_rotation(|_headers| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("timeout".to_string())
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
