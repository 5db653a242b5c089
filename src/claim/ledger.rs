//! One-time reward claims proven by a public social post.
//!
//! `initiate` hands out a short-lived verification code; `verify` checks the
//! live post for it and, in a single atomic store transaction, consumes the
//! code and mints the handle's one-time credential + credits. Everything
//! ambiguous (store down, lookup outage) fails closed; a claim is never
//! granted on uncertainty.

use std::sync::{Arc, LazyLock};

use rand::Rng;
use regex::Regex;

use crate::claim::lookup::PostLookup;
use crate::claim::store::{ClaimStore, NewClaim, PendingVerification};
use crate::config::ClaimConfig;
use crate::error::{ClaimError, ClaimStoreError, PostLookupError};

const VERIFICATION_CODE_LEN: usize = 5;
const API_KEY_PART_LEN: usize = 16;
const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static POST_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Unwrap is fine for a literal pattern.
    Regex::new(r"^https?://(?:www\.)?(?:twitter\.com|x\.com)/(\w+)/status/(\d+)").unwrap()
});

/// What `initiate` returns: the code plus the exact text to publish.
#[derive(Debug, Clone)]
pub struct ClaimPrompt {
    pub verification_code: String,
    pub post_text: String,
    pub instructions: String,
}

/// A successful claim.
#[derive(Debug, Clone)]
pub struct ClaimGrant {
    /// Minted API key, `{handle}-{random}`.
    pub api_key: String,
    pub credits: u32,
    /// Normalized handle that claimed.
    pub handle: String,
}

/// One-time reward claim ledger.
pub struct ClaimLedger {
    store: Arc<dyn ClaimStore>,
    lookup: PostLookup,
    config: ClaimConfig,
}

impl ClaimLedger {
    pub fn new(store: Arc<dyn ClaimStore>, lookup: PostLookup, config: ClaimConfig) -> Self {
        Self {
            store,
            lookup,
            config,
        }
    }

    /// Start a claim: mint a verification code with a TTL and return the
    /// post text the caller must publish.
    pub async fn initiate(&self) -> Result<ClaimPrompt, ClaimError> {
        self.store.ensure_ready().await.map_err(store_unavailable)?;

        let code = random_lowercase(VERIFICATION_CODE_LEN);
        let now = now_ts();
        let pending = PendingVerification {
            code: code.clone(),
            created_at: now,
            expires_at: now + self.config.verification_ttl.as_secs() as i64,
        };
        self.store
            .put_pending_verification(&pending)
            .await
            .map_err(ClaimError::from)?;

        tracing::info!(code, "created pending verification");

        let post_text = format!(
            "I'm claiming my free API credits on {} Mesh\n\nverification: {}",
            self.config.service_handle, code
        );
        Ok(ClaimPrompt {
            verification_code: code,
            instructions: format!(
                "Post the text above publicly, then verify with the post URL \
                 and verification code within {} seconds.",
                self.config.verification_ttl.as_secs()
            ),
            post_text,
        })
    }

    /// Redeem a claim: validate the live post and atomically issue the
    /// one-time credential for its author's handle.
    pub async fn verify(
        &self,
        post_url: &str,
        verification_code: &str,
    ) -> Result<ClaimGrant, ClaimError> {
        let code = verification_code.trim().to_lowercase();
        let now = now_ts();

        self.store.ensure_ready().await.map_err(store_unavailable)?;

        // Cheap pre-check so an obviously dead code fails before any network
        // lookup. The authoritative check is the transaction condition below.
        let active = self
            .store
            .is_code_active(&code, now)
            .await
            .map_err(ClaimError::from)?;
        if !active {
            return Err(ClaimError::InvalidOrExpiredCode);
        }

        let (url_handle, post_id) = parse_post_url(post_url)?;
        let post = self
            .lookup
            .fetch(&url_handle, &post_id)
            .await
            .map_err(|err| match err {
                PostLookupError::NotFound => ClaimError::PostNotFound,
                PostLookupError::Unavailable { reason } => ClaimError::LookupUnavailable { reason },
            })?;

        validate_claim_post(&post.text, &self.config.service_handle, &code)?;

        let handle = post.author_handle.to_lowercase();
        let api_key_part = random_lowercase(API_KEY_PART_LEN);
        let claim = NewClaim {
            handle: handle.clone(),
            post_id,
            verification_code: code,
            api_key_part: api_key_part.clone(),
            credits: self.config.free_credits,
            claimed_at: now,
        };
        self.store.commit_claim(&claim).await.map_err(ClaimError::from)?;

        tracing::info!(handle, "credits claimed");

        Ok(ClaimGrant {
            api_key: format!("{handle}-{api_key_part}"),
            credits: self.config.free_credits,
            handle,
        })
    }
}

fn store_unavailable(err: ClaimStoreError) -> ClaimError {
    // During the readiness probe, any failure means the service is down.
    match err {
        ClaimStoreError::Unavailable { reason } | ClaimStoreError::Internal { reason } => {
            ClaimError::StoreUnavailable { reason }
        }
        other => ClaimError::StoreUnavailable {
            reason: other.to_string(),
        },
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn random_lowercase(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Parse a status URL into `(handle, post_id)`.
pub fn parse_post_url(url: &str) -> Result<(String, String), ClaimError> {
    let caps = POST_URL_RE.captures(url).ok_or(ClaimError::InvalidPostUrl)?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// The post must mention the service handle and carry the exact code.
pub fn validate_claim_post(text: &str, service_handle: &str, code: &str) -> Result<(), ClaimError> {
    let text = text.to_lowercase();
    if !text.contains(&service_handle.to_lowercase()) {
        return Err(ClaimError::MissingClaimText);
    }
    // Word-bounded so code "abc12" does not match "abc123".
    let pattern = format!(r"\bverification:\s*{}\b", regex::escape(code));
    let re = Regex::new(&pattern).map_err(|e| ClaimError::Internal {
        reason: format!("bad verification pattern: {e}"),
    })?;
    if !re.is_match(&text) {
        return Err(ClaimError::MissingVerificationCode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_url_parsing() {
        let (handle, id) = parse_post_url("https://x.com/alice/status/12345").unwrap();
        assert_eq!((handle.as_str(), id.as_str()), ("alice", "12345"));

        let (handle, _) = parse_post_url("http://www.twitter.com/Bob_1/status/9").unwrap();
        assert_eq!(handle, "Bob_1");

        assert!(matches!(
            parse_post_url("https://example.com/alice/status/1"),
            Err(ClaimError::InvalidPostUrl)
        ));
        assert!(matches!(
            parse_post_url("https://x.com/alice/likes/1"),
            Err(ClaimError::InvalidPostUrl)
        ));
    }

    #[test]
    fn claim_text_validation() {
        let text = "I'm claiming my free API credits on @heurist_ai Mesh\n\nverification: ab3de";
        assert!(validate_claim_post(text, "@heurist_ai", "ab3de").is_ok());

        // Case-insensitive on both handle and code.
        assert!(validate_claim_post(
            "Claiming on @Heurist_AI! Verification: AB3DE",
            "@heurist_ai",
            "ab3de"
        )
        .is_ok());

        assert!(matches!(
            validate_claim_post("no mention, verification: ab3de", "@heurist_ai", "ab3de"),
            Err(ClaimError::MissingClaimText)
        ));
        assert!(matches!(
            validate_claim_post("@heurist_ai but no code", "@heurist_ai", "ab3de"),
            Err(ClaimError::MissingVerificationCode)
        ));
        // Code must match exactly, not as a prefix.
        assert!(matches!(
            validate_claim_post("@heurist_ai verification: ab3def", "@heurist_ai", "ab3de"),
            Err(ClaimError::MissingVerificationCode)
        ));
    }

    #[test]
    fn generated_codes_use_the_low_collision_alphabet() {
        for _ in 0..50 {
            let code = random_lowercase(VERIFICATION_CODE_LEN);
            assert_eq!(code.len(), VERIFICATION_CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }
}
