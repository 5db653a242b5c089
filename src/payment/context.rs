//! In-memory payment request contexts.
//!
//! The table is a fast local cache of "what did we ask the provider", keyed
//! by the provider-issued request id. It keeps repeated polls from opening
//! duplicate charges within one process; it is *not* a cross-process
//! uniqueness mechanism. Entries expire by TTL and are swept lazily whenever
//! the table is touched, so no background task is needed.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::payment::provider::PaymentStatus;

/// One charge attempt bound to one tool invocation.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub request_id: String,
    pub transaction_id: Option<String>,
    /// Provider-side payer account the charge was opened for.
    pub payer_id: String,
    pub agent_id: String,
    pub tool_name: String,
    /// Hash binding the charge to one exact payload for its whole lifetime.
    pub args_hash: String,
    pub status: PaymentStatus,
    pub approved: bool,
    pub consumed: bool,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_checked_at: Option<i64>,
    /// Job id recorded when the original paid call completed, for the
    /// status-reuse allowlist.
    pub linked_job_id: Option<String>,
    /// Research id recorded when the original paid call completed.
    pub linked_research_id: Option<String>,
}

/// Table of live payment contexts with lazy TTL eviction.
pub struct ContextTable {
    inner: RwLock<HashMap<String, PaymentContext>>,
    ttl: Duration,
}

impl ContextTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current wall-clock UNIX timestamp.
    pub fn now_ts() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Drop every entry past its TTL.
    pub async fn sweep_expired(&self) {
        let now = Self::now_ts();
        self.inner.write().await.retain(|_, ctx| ctx.expires_at > now);
    }

    pub async fn insert(&self, ctx: PaymentContext) {
        self.inner.write().await.insert(ctx.request_id.clone(), ctx);
    }

    pub async fn get(&self, request_id: &str) -> Option<PaymentContext> {
        self.inner.read().await.get(request_id).cloned()
    }

    pub async fn remove(&self, request_id: &str) -> Option<PaymentContext> {
        self.inner.write().await.remove(request_id)
    }

    /// Mutate an entry in place; returns false when the id is unknown.
    pub async fn update<F>(&self, request_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PaymentContext),
    {
        match self.inner.write().await.get_mut(request_id) {
            Some(ctx) => {
                f(ctx);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Hash binding a charge to one `(agent, tool, arguments, payer)` tuple.
///
/// SHA-256 over canonical JSON (sorted keys, compact separators) so that
/// semantically identical payloads hash identically regardless of field
/// order in the caller's request.
pub fn hash_request_payload(
    agent_id: &str,
    tool: Option<&str>,
    tool_arguments: &Value,
    user_id: &str,
) -> String {
    let mut out = String::new();
    out.push_str("{\"agent_id\":");
    write_canonical(&Value::from(agent_id), &mut out);
    out.push_str(",\"tool\":");
    write_canonical(&tool.map(Value::from).unwrap_or(Value::Null), &mut out);
    out.push_str(",\"tool_arguments\":");
    write_canonical(tool_arguments, &mut out);
    out.push_str(",\"user_id\":");
    write_canonical(&Value::from(user_id), &mut out);
    out.push('}');

    let digest = Sha256::digest(out.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Serialize a JSON value with object keys sorted recursively.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // String keys always serialize cleanly.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = json!({"query": "X", "depth": 2});
        let b = json!({"depth": 2, "query": "X"});
        assert_eq!(
            hash_request_payload("agent", Some("tool"), &a, "u1"),
            hash_request_payload("agent", Some("tool"), &b, "u1"),
        );
    }

    #[test]
    fn hash_binds_every_field() {
        let args = json!({"query": "X"});
        let base = hash_request_payload("agent", Some("tool"), &args, "u1");
        assert_ne!(base, hash_request_payload("agent2", Some("tool"), &args, "u1"));
        assert_ne!(base, hash_request_payload("agent", Some("other"), &args, "u1"));
        assert_ne!(
            base,
            hash_request_payload("agent", Some("tool"), &json!({"query": "Y"}), "u1")
        );
        assert_ne!(base, hash_request_payload("agent", Some("tool"), &args, "u2"));
    }

    #[test]
    fn canonical_nested_objects_sort_recursively() {
        let mut out = String::new();
        write_canonical(&json!({"b": {"z": 1, "a": [true, null]}, "a": 2}), &mut out);
        assert_eq!(out, r#"{"a":2,"b":{"a":[true,null],"z":1}}"#);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_entries() {
        let table = ContextTable::new(std::time::Duration::from_secs(1800));
        let now = ContextTable::now_ts();
        for (id, expires_at) in [("live", now + 100), ("dead", now - 1)] {
            table
                .insert(PaymentContext {
                    request_id: id.to_string(),
                    transaction_id: None,
                    payer_id: "u1".to_string(),
                    agent_id: "agent".to_string(),
                    tool_name: "tool".to_string(),
                    args_hash: String::new(),
                    status: PaymentStatus::Pending,
                    approved: false,
                    consumed: false,
                    created_at: now,
                    expires_at,
                    last_checked_at: None,
                    linked_job_id: None,
                    linked_research_id: None,
                })
                .await;
        }

        table.sweep_expired().await;
        assert!(table.get("live").await.is_some());
        assert!(table.get("dead").await.is_none());
        assert_eq!(table.len().await, 1);
    }
}
