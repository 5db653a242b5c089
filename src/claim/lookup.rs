//! Social post lookup with source failover.
//!
//! A claim is proven by a public post, fetched from a primary public JSON
//! source and, when configured, a secondary keyed source. The load-bearing
//! distinction is "post genuinely does not exist" (every source confirms
//! 404) versus "a source is down" (anything else): only the former is
//! authoritative, so a transient outage is surfaced as retryable instead of
//! eating the claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::config::ClaimConfig;
use crate::error::PostLookupError;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// A fetched social post.
#[derive(Debug, Clone)]
pub struct Post {
    /// Author handle as reported by the source (not yet normalized).
    pub author_handle: String,
    /// Full post text.
    pub text: String,
}

/// One lookup source. `NotFound` must only be returned when the source
/// authoritatively reports the post does not exist.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &'static str;

    async fn fetch_post(&self, username: &str, post_id: &str) -> Result<Post, PostLookupError>;
}

/// Primary source: public fxtwitter-shaped JSON endpoint, no key required.
pub struct FxTwitterSource {
    client: Client,
    base_url: String,
}

impl FxTwitterSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PostLookupError> {
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| PostLookupError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PostSource for FxTwitterSource {
    fn name(&self) -> &'static str {
        "fxtwitter"
    }

    async fn fetch_post(&self, username: &str, post_id: &str) -> Result<Post, PostLookupError> {
        let url = format!("{}/{}/status/{}", self.base_url, username, post_id);
        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| PostLookupError::Unavailable {
                    reason: e.to_string(),
                })?;

        let status = response.status().as_u16();
        if status == 404 {
            return Err(PostLookupError::NotFound);
        }
        if status != 200 {
            tracing::warn!(source = self.name(), post_id, status, "unexpected lookup status");
            return Err(PostLookupError::Unavailable {
                reason: format!("HTTP {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PostLookupError::Unavailable {
                reason: format!("invalid JSON: {e}"),
            })?;

        let embedded_ok = body.get("code").and_then(Value::as_i64) == Some(200);
        let tweet = body.get("tweet").filter(|t| t.is_object());
        match tweet {
            Some(tweet) if embedded_ok => Ok(Post {
                author_handle: tweet
                    .get("author")
                    .and_then(|a| a.get("screen_name"))
                    .and_then(Value::as_str)
                    .unwrap_or(username)
                    .to_string(),
                text: tweet
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => Err(PostLookupError::Unavailable {
                reason: "response missing tweet payload".to_string(),
            }),
        }
    }
}

/// Secondary source: keyed detail endpoint, consulted when the primary is
/// down or disagrees.
pub struct ApiDanceSource {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl ApiDanceSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
    ) -> Result<Self, PostLookupError> {
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| PostLookupError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl PostSource for ApiDanceSource {
    fn name(&self) -> &'static str {
        "apidance"
    }

    async fn fetch_post(&self, username: &str, post_id: &str) -> Result<Post, PostLookupError> {
        let url = format!("{}/sapi/TweetDetail?tweet_id={}", self.base_url, post_id);
        let response = self
            .client
            .get(&url)
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| PostLookupError::Unavailable {
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if status == 404 {
            return Err(PostLookupError::NotFound);
        }
        if status != 200 {
            tracing::warn!(source = self.name(), post_id, status, "unexpected lookup status");
            return Err(PostLookupError::Unavailable {
                reason: format!("HTTP {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PostLookupError::Unavailable {
                reason: format!("invalid JSON: {e}"),
            })?;

        let root = body.get("data").filter(|d| d.is_object()).unwrap_or(&body);
        let tweets = root
            .get("tweets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for tweet in &tweets {
            let tid = tweet
                .get("tweet_id")
                .or_else(|| tweet.get("id_str"))
                .or_else(|| tweet.get("id"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            if tid == post_id {
                return Ok(Post {
                    author_handle: tweet
                        .get("user")
                        .and_then(|u| u.get("screen_name"))
                        .and_then(Value::as_str)
                        .unwrap_or(username)
                        .to_string(),
                    text: tweet
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }

        // A well-formed detail response without the requested id is the
        // source saying the post does not exist.
        Err(PostLookupError::NotFound)
    }
}

/// Ordered failover over the configured lookup sources.
pub struct PostLookup {
    sources: Vec<Arc<dyn PostSource>>,
}

impl PostLookup {
    pub fn new(sources: Vec<Arc<dyn PostSource>>) -> Self {
        Self { sources }
    }

    /// Build the production source chain: public primary always, keyed
    /// secondary only when a key is configured.
    pub fn from_config(config: &ClaimConfig) -> Result<Self, PostLookupError> {
        let mut sources: Vec<Arc<dyn PostSource>> = vec![Arc::new(FxTwitterSource::new(
            config.primary_lookup_base_url.clone(),
        )?)];
        if let Some(key) = &config.secondary_lookup_api_key {
            sources.push(Arc::new(ApiDanceSource::new(
                config.secondary_lookup_base_url.clone(),
                key.clone(),
            )?));
        }
        Ok(Self::new(sources))
    }

    /// Try each source in order, returning the first hit.
    ///
    /// `NotFound` is returned only when *every* source confirmed 404; any
    /// other mix of failures is a transient `Unavailable`.
    pub async fn fetch(&self, username: &str, post_id: &str) -> Result<Post, PostLookupError> {
        let mut attempts = 0usize;
        let mut not_found = 0usize;
        let mut reasons: Vec<String> = Vec::new();

        for source in &self.sources {
            attempts += 1;
            match source.fetch_post(username, post_id).await {
                Ok(post) => return Ok(post),
                Err(PostLookupError::NotFound) => {
                    not_found += 1;
                    reasons.push(format!("{}: not found", source.name()));
                }
                Err(PostLookupError::Unavailable { reason }) => {
                    tracing::warn!(source = source.name(), post_id, %reason, "post lookup failed");
                    reasons.push(format!("{}: {reason}", source.name()));
                }
            }
        }

        if attempts > 0 && not_found == attempts {
            Err(PostLookupError::NotFound)
        } else {
            Err(PostLookupError::Unavailable {
                reason: reasons.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubPostSource;

    #[tokio::test]
    async fn first_source_hit_short_circuits() {
        let lookup = PostLookup::new(vec![
            Arc::new(StubPostSource::found("alice", "hello")),
            Arc::new(StubPostSource::unavailable("down")),
        ]);

        let post = lookup.fetch("alice", "1").await.unwrap();
        assert_eq!(post.author_handle, "alice");
    }

    #[tokio::test]
    async fn all_not_found_is_authoritative() {
        let lookup = PostLookup::new(vec![
            Arc::new(StubPostSource::not_found()),
            Arc::new(StubPostSource::not_found()),
        ]);

        let err = lookup.fetch("alice", "1").await.unwrap_err();
        assert!(matches!(err, PostLookupError::NotFound));
    }

    #[tokio::test]
    async fn mixed_failures_stay_transient() {
        // One 404 plus one outage must NOT report not-found: the outage
        // source might have returned the post.
        let lookup = PostLookup::new(vec![
            Arc::new(StubPostSource::not_found()),
            Arc::new(StubPostSource::unavailable("timeout")),
        ]);

        let err = lookup.fetch("alice", "1").await.unwrap_err();
        assert!(matches!(err, PostLookupError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn secondary_covers_primary_outage() {
        let lookup = PostLookup::new(vec![
            Arc::new(StubPostSource::unavailable("500")),
            Arc::new(StubPostSource::found("bob", "the text")),
        ]);

        let post = lookup.fetch("bob", "2").await.unwrap();
        assert_eq!(post.text, "the text");
    }
}
