//! In-memory stand-ins for the external collaborators.
//!
//! Used by unit and integration tests to drive the full admission and claim
//! flows without a payment provider, a keyed store, or the network. All of
//! them use plain `std::sync::Mutex` state so tests can arrange scenarios
//! from synchronous code.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, Once};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::{Value, json};

use crate::claim::{ClaimStore, NewClaim, PendingVerification, Post, PostSource};
use crate::config::PaymentConfig;
use crate::error::{ClaimStoreError, GatewayError, PostLookupError};
use crate::payment::{
    AttachDetails, ChargeStatus, CreatedCharge, PaymentGateway, PaymentStatus, RequestSource,
    TransactionRecord,
};

/// Install a tracing subscriber for tests, once per process.
///
/// Honors `RUST_LOG`, defaulting to `info`. Output goes through the test
/// writer so it is captured per test and only shown on failure.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A `PaymentConfig` pointing nowhere, for wiring controllers in tests.
pub fn payment_config() -> PaymentConfig {
    PaymentConfig {
        base_url: "http://payment.invalid".to_string(),
        api_key: SecretString::from("test-key"),
        context_ttl: Duration::from_secs(1800),
        signup_rate_limit_window: Duration::from_secs(300),
        request_timeout: Duration::from_secs(5),
    }
}

#[derive(Default)]
struct StubGatewayState {
    /// Request id -> current status.
    requests: HashMap<String, PaymentStatus>,
    /// Transaction id -> raw provider transaction status string.
    transactions: HashMap<String, String>,
    last_amount: Option<Decimal>,
    /// When set, direct request lookup answers 404 `APPROVAL_NOT_FOUND`,
    /// forcing the transaction fallback path.
    request_lookup_missing: bool,
}

/// Scriptable in-memory payment provider.
///
/// Charges get sequential ids `r1`, `r2`, ... with transaction ids `t1`,
/// `t2`, ..., and open as `Pending` until a test flips them with
/// [`StubGateway::set_status`].
pub struct StubGateway {
    counter: AtomicU32,
    state: Mutex<StubGatewayState>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            state: Mutex::new(StubGatewayState::default()),
        }
    }

    /// How many charges have been opened.
    pub fn create_calls(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    /// USD amount of the most recent charge.
    pub fn last_amount(&self) -> Option<Decimal> {
        self.state.lock().unwrap().last_amount
    }

    /// Set the status a direct request lookup reports.
    pub fn set_status(&self, request_id: &str, status: PaymentStatus) {
        self.state
            .lock()
            .unwrap()
            .requests
            .insert(request_id.to_string(), status);
    }

    /// Make direct request lookups 404 with `APPROVAL_NOT_FOUND`, as seen by
    /// accounts that can only read transaction records.
    pub fn set_request_lookup_missing(&self, missing: bool) {
        self.state.lock().unwrap().request_lookup_missing = missing;
    }

    /// Set the raw status string of a transaction record (e.g. `"PAID"`).
    pub fn set_transaction_status(&self, transaction_id: &str, raw_status: &str) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(transaction_id.to_string(), raw_status.to_string());
    }

    fn approval_not_found() -> GatewayError {
        GatewayError::Rejected {
            status: 404,
            message: "failed to fetch payment request status".to_string(),
            body: json!({"errors": [{"code": "APPROVAL_NOT_FOUND"}]}),
        }
    }
}

impl Default for StubGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_charge(
        &self,
        _user_id: &str,
        amount_usd: Decimal,
        _currency: &str,
    ) -> Result<CreatedCharge, GatewayError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = format!("r{n}");
        let transaction_id = format!("t{n}");

        let mut state = self.state.lock().unwrap();
        state.requests.insert(request_id.clone(), PaymentStatus::Pending);
        state.last_amount = Some(amount_usd);

        Ok(CreatedCharge {
            raw: json!({
                "requestId": request_id,
                "transactionId": transaction_id,
                "status": "PENDING",
            }),
            request_id,
            transaction_id: Some(transaction_id),
            status: PaymentStatus::Pending,
        })
    }

    async fn get_request(&self, request_id: &str) -> Result<ChargeStatus, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.request_lookup_missing {
            return Err(Self::approval_not_found());
        }
        let status = state
            .requests
            .get(request_id)
            .copied()
            .ok_or_else(Self::approval_not_found)?;

        Ok(ChargeStatus {
            request_id: request_id.to_string(),
            status,
            transaction_id: None,
            source: RequestSource::Direct,
            raw: json!({"requestId": request_id, "status": status.as_str()}),
        })
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .get(transaction_id)
            .map(|raw_status| TransactionRecord {
                transaction_id: Some(transaction_id.to_string()),
                status: PaymentStatus::from_transaction_status(raw_status),
                raw: json!({"transactionId": transaction_id, "status": raw_status}),
            }))
    }

    async fn find_transaction_by_approval_id(
        &self,
        _approval_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError> {
        Ok(None)
    }

    async fn signup_agentic_user(
        &self,
        locale: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Value, GatewayError> {
        Ok(json!({
            "userId": "agentic-user",
            "privateKey": "stub-private-key",
            "locale": locale,
            "timezone": timezone,
        }))
    }

    async fn attach_agentic_user(
        &self,
        _private_key: &str,
        details: &AttachDetails,
    ) -> Result<Value, GatewayError> {
        Ok(json!({"success": true, "email": details.email}))
    }
}

#[derive(Default)]
struct MemoryClaimState {
    pending: HashMap<String, PendingVerification>,
    claims: HashMap<String, NewClaim>,
    credentials: HashSet<String>,
    allowances: HashSet<String>,
    unavailable: bool,
}

/// In-memory [`ClaimStore`] with the same condition semantics as the real
/// transactional backend. One lock around all four record families makes
/// `commit_claim` all-or-nothing, so concurrent claims race exactly like
/// they do against the production store.
pub struct MemoryClaimStore {
    state: Mutex<MemoryClaimState>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryClaimState::default()),
        }
    }

    /// Simulate the backing store being down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// The committed claim for a handle, if any.
    pub fn claim_for(&self, handle: &str) -> Option<NewClaim> {
        self.state.lock().unwrap().claims.get(handle).cloned()
    }

    fn check_available(state: &MemoryClaimState) -> Result<(), ClaimStoreError> {
        if state.unavailable {
            Err(ClaimStoreError::Unavailable {
                reason: "store marked unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryClaimStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn ensure_ready(&self) -> Result<(), ClaimStoreError> {
        Self::check_available(&self.state.lock().unwrap())
    }

    async fn put_pending_verification(
        &self,
        pending: &PendingVerification,
    ) -> Result<(), ClaimStoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.pending.insert(pending.code.clone(), pending.clone());
        Ok(())
    }

    async fn is_code_active(&self, code: &str, now_ts: i64) -> Result<bool, ClaimStoreError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state
            .pending
            .get(code)
            .is_some_and(|pending| pending.expires_at > now_ts))
    }

    async fn is_handle_claimed(&self, handle: &str) -> Result<bool, ClaimStoreError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.claims.contains_key(handle))
    }

    async fn commit_claim(&self, claim: &NewClaim) -> Result<(), ClaimStoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;

        // Evaluate every condition before touching any record, mirroring the
        // backend's all-or-nothing transaction.
        if state.claims.contains_key(&claim.handle)
            || state.credentials.contains(&claim.handle)
            || state.allowances.contains(&claim.handle)
        {
            return Err(ClaimStoreError::AlreadyClaimed);
        }
        let code_live = state
            .pending
            .get(&claim.verification_code)
            .is_some_and(|pending| pending.expires_at > claim.claimed_at);
        if !code_live {
            return Err(ClaimStoreError::InvalidOrExpiredCode);
        }

        state.pending.remove(&claim.verification_code);
        state.claims.insert(claim.handle.clone(), claim.clone());
        state.credentials.insert(claim.handle.clone());
        state.allowances.insert(claim.handle.clone());
        Ok(())
    }
}

enum StubPostOutcome {
    Found { author: String, text: String },
    NotFound,
    Unavailable { reason: String },
}

/// Post lookup source with a fixed outcome.
pub struct StubPostSource {
    outcome: StubPostOutcome,
}

impl StubPostSource {
    pub fn found(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            outcome: StubPostOutcome::Found {
                author: author.into(),
                text: text.into(),
            },
        }
    }

    pub fn not_found() -> Self {
        Self {
            outcome: StubPostOutcome::NotFound,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            outcome: StubPostOutcome::Unavailable {
                reason: reason.into(),
            },
        }
    }
}

#[async_trait]
impl PostSource for StubPostSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn fetch_post(&self, _username: &str, _post_id: &str) -> Result<Post, PostLookupError> {
        match &self.outcome {
            StubPostOutcome::Found { author, text } => Ok(Post {
                author_handle: author.clone(),
                text: text.clone(),
            }),
            StubPostOutcome::NotFound => Err(PostLookupError::NotFound),
            StubPostOutcome::Unavailable { reason } => Err(PostLookupError::Unavailable {
                reason: reason.clone(),
            }),
        }
    }
}
