//! Relay client with round-robin failover.
//!
//! Forwards outbound API calls through a fleet of relay servers. Every call
//! walks the full fleet starting from a rotating cursor, so load spreads
//! across servers and a single dead relay never takes the client down.

use std::collections::HashMap;
use std::sync::Mutex;

use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Relay-side HTTP statuses worth retrying on another server.
const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// One outbound call to forward through a relay.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardRequest {
    /// Caller identity, echoed to the relay for accounting.
    pub agent_name: String,
    /// Target URL the relay should call.
    pub api_url: String,
    /// HTTP method for the target call.
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_data: Option<Value>,
}

impl ForwardRequest {
    pub fn new(
        agent_name: impl Into<String>,
        api_url: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            api_url: api_url.into(),
            method: method.into(),
            headers: None,
            params: None,
            json_data: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_json(mut self, json_data: Value) -> Self {
        self.json_data = Some(json_data);
        self
    }
}

/// Round-robin failover client over the configured relay servers.
pub struct ProxyFailoverClient {
    client: Client,
    config: ProxyConfig,
    cursor: Mutex<usize>,
}

impl ProxyFailoverClient {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            cursor: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.servers.is_empty()
    }

    /// Full server rotation for one forward attempt, starting at the cursor.
    /// The cursor advances by one per call so consecutive forwards start on
    /// different servers.
    fn next_rotation(&self) -> Vec<String> {
        let servers = &self.config.servers;
        let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
        let start = *cursor % servers.len();
        *cursor = (start + 1) % servers.len();
        servers[start..]
            .iter()
            .chain(servers[..start].iter())
            .cloned()
            .collect()
    }

    /// Forward a call through the relay fleet.
    ///
    /// Tries every server once in rotation order. A server attempt succeeds
    /// only on HTTP 200 with a `status: "success"` body; anything else
    /// (connect error, timeout, bad JSON, relay-reported failure) moves on to
    /// the next server. When the whole fleet fails, the per-server errors are
    /// collected into [`ProxyError::AllServersFailed`].
    pub async fn forward(&self, request: &ForwardRequest) -> Result<Value, ProxyError> {
        if !self.config.enabled {
            return Err(ProxyError::Disabled);
        }
        if self.config.servers.is_empty() {
            return Err(ProxyError::NoServers);
        }
        let auth_key = self
            .config
            .auth_key
            .as_ref()
            .ok_or(ProxyError::MissingAuthKey)?;

        let rotation = self.next_rotation();
        let attempted = rotation.len();
        let mut errors: Vec<String> = Vec::new();

        for server in rotation {
            let url = format!("{}/proxy", server.trim_end_matches('/'));
            tracing::debug!(agent = %request.agent_name, server = %server, "forwarding through relay");

            let response = match self
                .client
                .post(&url)
                .timeout(self.config.timeout)
                .bearer_auth(auth_key.expose_secret())
                .json(request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let reason = if err.is_timeout() {
                        "Request timeout".to_string()
                    } else {
                        format!("Connection error: {err}")
                    };
                    tracing::warn!(server = %server, %reason, "relay unreachable");
                    errors.push(format!("{server}: {reason}"));
                    continue;
                }
            };

            let status = response.status().as_u16();
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(server = %server, status, "relay returned invalid JSON");
                    errors.push(format!("{server}: invalid JSON response (HTTP {status}): {err}"));
                    continue;
                }
            };

            if status == 200 && body.get("status").and_then(Value::as_str) == Some("success") {
                tracing::debug!(server = %server, "relay forward succeeded");
                return Ok(body);
            }

            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            if RETRYABLE_STATUS_CODES.contains(&status) {
                tracing::warn!(server = %server, status, %reason, "retryable relay failure");
            } else {
                tracing::warn!(server = %server, status, %reason, "relay rejected forward");
            }
            errors.push(format!("{server}: {reason}"));
        }

        tracing::error!(attempted, "all relay servers failed");
        Err(ProxyError::AllServersFailed { attempted, errors })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;

    fn config(servers: &[&str]) -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            servers: servers.iter().map(|s| s.to_string()).collect(),
            auth_key: Some(SecretString::from("relay-key")),
            timeout: Duration::from_secs(30),
        }
    }

    fn request() -> ForwardRequest {
        ForwardRequest::new("SomeAgent", "https://api.example.com/v1/data", "GET")
    }

    #[tokio::test]
    async fn disabled_client_refuses_immediately() {
        let mut cfg = config(&["http://relay-a"]);
        cfg.enabled = false;
        let client = ProxyFailoverClient::new(cfg);

        let err = client.forward(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Disabled));
    }

    #[tokio::test]
    async fn empty_fleet_is_an_error() {
        let client = ProxyFailoverClient::new(config(&[]));

        let err = client.forward(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoServers));
    }

    #[tokio::test]
    async fn missing_auth_key_is_an_error() {
        let mut cfg = config(&["http://relay-a"]);
        cfg.auth_key = None;
        let client = ProxyFailoverClient::new(cfg);

        let err = client.forward(&request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingAuthKey));
    }

    #[test]
    fn rotation_starts_on_a_different_server_each_call() {
        let client =
            ProxyFailoverClient::new(config(&["http://a", "http://b", "http://c"]));

        assert_eq!(
            client.next_rotation(),
            vec!["http://a", "http://b", "http://c"]
        );
        assert_eq!(
            client.next_rotation(),
            vec!["http://b", "http://c", "http://a"]
        );
        assert_eq!(
            client.next_rotation(),
            vec!["http://c", "http://a", "http://b"]
        );
        // Wraps back around.
        assert_eq!(
            client.next_rotation(),
            vec!["http://a", "http://b", "http://c"]
        );
    }

    #[test]
    fn rotation_always_covers_the_whole_fleet() {
        let client = ProxyFailoverClient::new(config(&["http://a", "http://b"]));
        for _ in 0..5 {
            let mut rotation = client.next_rotation();
            rotation.sort();
            assert_eq!(rotation, vec!["http://a", "http://b"]);
        }
    }

    #[test]
    fn forward_request_omits_unset_fields() {
        let payload = serde_json::to_value(request()).unwrap();
        assert_eq!(payload["agent_name"], "SomeAgent");
        assert!(payload.get("headers").is_none());
        assert!(payload.get("json_data").is_none());
    }
}
