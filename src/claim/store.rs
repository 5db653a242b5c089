//! Transactional keyed store behind the claim ledger.
//!
//! The store is the *only* source of correctness for one-time claims: the
//! in-process ledger never assumes its own view is authoritative, because
//! another process may be racing on the same handle. Backends must support
//! conditional writes and an all-or-nothing multi-item transaction.

use async_trait::async_trait;

use crate::error::ClaimStoreError;

/// A verification code awaiting proof, with its redemption window.
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub code: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Everything the atomic claim transaction writes.
#[derive(Debug, Clone)]
pub struct NewClaim {
    /// Normalized (lowercase) social handle redeeming the reward.
    pub handle: String,
    /// The post that proved ownership of the handle.
    pub post_id: String,
    /// The pending code being consumed.
    pub verification_code: String,
    /// Random suffix of the minted API key (the full key is
    /// `{handle}-{api_key_part}`).
    pub api_key_part: String,
    /// Credits granted with the claim.
    pub credits: u32,
    /// Transaction timestamp, also used to evaluate the code's TTL condition.
    pub claimed_at: i64,
}

/// Storage abstraction for pending verification codes and claimed handles.
///
/// Implementations sit on a store with conditional writes (attribute
/// existence / equality) and multi-item transactions spanning the claims
/// ledger and the user/credential records.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Probe that the backing tables are reachable. Called before every
    /// ledger operation so claims fail closed when storage is down.
    async fn ensure_ready(&self) -> Result<(), ClaimStoreError>;

    /// Store a pending verification code. Overwriting an identical code is
    /// harmless (codes are random and low-collision).
    async fn put_pending_verification(
        &self,
        pending: &PendingVerification,
    ) -> Result<(), ClaimStoreError>;

    /// Consistent point read: is this code still a live, unexpired pending
    /// verification at `now_ts`?
    async fn is_code_active(&self, code: &str, now_ts: i64) -> Result<bool, ClaimStoreError>;

    /// Consistent point read: has this handle already claimed?
    async fn is_handle_claimed(&self, handle: &str) -> Result<bool, ClaimStoreError>;

    /// Atomically consume the verification code and issue the claim.
    ///
    /// One all-or-nothing transaction across four records:
    /// 1. delete the pending verification, conditioned on it existing,
    ///    being a pending record, and being unexpired at `claimed_at`;
    /// 2. insert the claimed-handle record, conditioned on it not existing;
    /// 3. insert the credential record, conditioned on it not existing;
    /// 4. insert the credits/allowance record, conditioned on it not existing.
    ///
    /// If any condition fails the whole transaction is rejected with no
    /// partial state. Condition failures map to [`ClaimStoreError::AlreadyClaimed`]
    /// (handle exists) or [`ClaimStoreError::InvalidOrExpiredCode`] (code
    /// missing/expired); anything else is `Unavailable`/`Internal`. This
    /// all-or-nothing shape is what prevents two concurrent verifications of
    /// the same handle, or a reused code, from both succeeding; do not
    /// weaken it to independent writes.
    async fn commit_claim(&self, claim: &NewClaim) -> Result<(), ClaimStoreError>;
}
