//! Payment admission control for metered tool calls.
//!
//! Two-phase protocol: the first call (no request id) opens a charge with the
//! provider and returns `Pending`; the caller retries with the returned id
//! after user-side approval. Every poll re-validates that the id still maps
//! to the same payer, agent, and exact tool payload before the provider is
//! consulted, so a paid request id cannot be replayed against a different
//! call.
//!
//! A narrow allowlist of "check status of an async job" tools may reuse an
//! already-approved charge without re-billing, but only for the job the
//! original paid call actually started.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PaymentConfig;
use crate::error::AdmissionError;
use crate::payment::context::{ContextTable, PaymentContext, hash_request_payload};
use crate::payment::provider::{ChargeStatus, PaymentGateway, PaymentStatus};

/// The only settlement currency the provider accepts.
const SUPPORTED_CURRENCY: &str = "USDC";

/// Floor charge in USD; the provider rejects zero-amount requests.
const MINIMUM_CHARGE_USD: Decimal = dec!(0.01);

/// `(agent_id, tool)` pairs allowed to reuse an approved charge to poll a
/// previously started async job.
const STATUS_REUSE_ALLOWLIST: &[(&str, &str)] = &[
    ("AskHeuristAgent", "check_job_status"),
    ("CaesarResearchAgent", "get_research_result"),
];

/// Caller-supplied payment block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Provider-side payer account id.
    pub user_id: String,
    /// Settlement currency; only USDC is accepted.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Absent on the first call; set to the returned id when polling.
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_currency() -> String {
    SUPPORTED_CURRENCY.to_string()
}

/// The tool call being gated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Tool to execute; required on the metered path.
    #[serde(default)]
    pub tool: Option<String>,
    /// Tool arguments object.
    #[serde(default = "empty_object")]
    pub tool_arguments: Value,
    /// Free-form query input; not supported on the metered path.
    #[serde(default)]
    pub query: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, tool_arguments: Value) -> Self {
        Self {
            tool: Some(tool.into()),
            tool_arguments,
            query: None,
        }
    }

    fn arg_str(&self, key: &str) -> Option<&str> {
        self.tool_arguments.get(key).and_then(Value::as_str)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// A charge was opened; retry with this request id once approved.
    Pending {
        request_id: String,
        /// Raw provider request record for caller display.
        provider_request: Value,
    },
    /// The charge exists but is not approved yet (or reached a terminal
    /// non-approved status). Carries the raw status so the caller decides
    /// whether to keep polling.
    NotReady {
        request_id: String,
        status: PaymentStatus,
        provider_request: Value,
    },
    /// Execution may proceed.
    Approved {
        request_id: String,
        /// True when an allowlisted status tool reused the original charge.
        reused: bool,
    },
}

impl AdmissionDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, AdmissionDecision::Approved { .. })
    }
}

/// Gates metered tool execution behind provider-approved charges.
pub struct AdmissionController {
    gateway: Arc<dyn PaymentGateway>,
    contexts: ContextTable,
}

impl AdmissionController {
    pub fn new(gateway: Arc<dyn PaymentGateway>, config: &PaymentConfig) -> Self {
        Self {
            gateway,
            contexts: ContextTable::new(config.context_ttl),
        }
    }

    /// Decide whether a metered call may run.
    ///
    /// `agent_credits` is the agent's price in credits; 100 credits = 1 USD,
    /// floored at [`MINIMUM_CHARGE_USD`].
    pub async fn admit(
        &self,
        payment: &PaymentRequest,
        agent_id: &str,
        invocation: &ToolInvocation,
        agent_credits: Decimal,
    ) -> Result<AdmissionDecision, AdmissionError> {
        if invocation.tool.as_deref().unwrap_or("").is_empty() {
            return Err(AdmissionError::MissingTool);
        }
        if invocation.query.as_deref().is_some_and(|q| !q.is_empty()) {
            return Err(AdmissionError::QueryNotSupported);
        }
        if payment.currency != SUPPORTED_CURRENCY {
            return Err(AdmissionError::UnsupportedCurrency {
                currency: payment.currency.clone(),
            });
        }

        match payment.request_id.as_deref() {
            None => self.open_charge(payment, agent_id, invocation, agent_credits).await,
            Some(request_id) => {
                self.poll_charge(request_id, payment, agent_id, invocation, agent_credits)
                    .await
            }
        }
    }

    async fn open_charge(
        &self,
        payment: &PaymentRequest,
        agent_id: &str,
        invocation: &ToolInvocation,
        agent_credits: Decimal,
    ) -> Result<AdmissionDecision, AdmissionError> {
        let amount_usd = (agent_credits / dec!(100))
            .max(MINIMUM_CHARGE_USD)
            .round_dp(2);

        let created = self
            .gateway
            .create_charge(&payment.user_id, amount_usd, &payment.currency)
            .await?;

        self.contexts.sweep_expired().await;
        let now = ContextTable::now_ts();
        let ttl = self.contexts.ttl().as_secs() as i64;
        let ctx = PaymentContext {
            request_id: created.request_id.clone(),
            transaction_id: created.transaction_id.clone(),
            payer_id: payment.user_id.clone(),
            agent_id: agent_id.to_string(),
            tool_name: invocation.tool.clone().unwrap_or_default(),
            args_hash: hash_request_payload(
                agent_id,
                invocation.tool.as_deref(),
                &invocation.tool_arguments,
                &payment.user_id,
            ),
            status: created.status,
            approved: false,
            consumed: false,
            created_at: now,
            expires_at: now + ttl,
            last_checked_at: None,
            linked_job_id: None,
            linked_research_id: None,
        };
        self.contexts.insert(ctx).await;

        tracing::info!(
            request_id = %created.request_id,
            agent_id,
            amount = %amount_usd,
            "opened payment request"
        );

        Ok(AdmissionDecision::Pending {
            request_id: created.request_id,
            provider_request: created.raw,
        })
    }

    async fn poll_charge(
        &self,
        request_id: &str,
        payment: &PaymentRequest,
        agent_id: &str,
        invocation: &ToolInvocation,
        agent_credits: Decimal,
    ) -> Result<AdmissionDecision, AdmissionError> {
        self.contexts.sweep_expired().await;

        let ctx = self
            .contexts
            .get(request_id)
            .await
            .ok_or(AdmissionError::UnknownRequestId)?;

        // Allowlisted status-check tools ride on the original approved charge.
        if is_valid_status_reuse(payment, agent_id, invocation, &ctx) {
            tracing::debug!(request_id, agent_id, "reusing approved charge for status check");
            return Ok(AdmissionDecision::Approved {
                request_id: request_id.to_string(),
                reused: true,
            });
        }

        let expected_hash = hash_request_payload(
            agent_id,
            invocation.tool.as_deref(),
            &invocation.tool_arguments,
            &payment.user_id,
        );

        // An allowlisted status tool whose reuse check failed (wrong job id,
        // or a charge that never linked one) is not an error: it is billed as
        // a brand-new admission instead of free-riding on the old charge.
        let polls_own_charge = ctx.args_hash == expected_hash
            && ctx.payer_id == payment.user_id
            && ctx.agent_id == agent_id;
        if !polls_own_charge && is_allowlisted_status_tool(agent_id, invocation) {
            tracing::info!(
                request_id,
                agent_id,
                "status-check reuse denied, opening fresh charge"
            );
            return self.open_charge(payment, agent_id, invocation, agent_credits).await;
        }

        if ctx.consumed {
            return Err(AdmissionError::Consumed);
        }
        if ctx.expires_at <= ContextTable::now_ts() {
            self.contexts.remove(request_id).await;
            return Err(AdmissionError::Expired);
        }
        if ctx.payer_id != payment.user_id || ctx.agent_id != agent_id {
            return Err(AdmissionError::IdentityMismatch);
        }
        if expected_hash != ctx.args_hash {
            return Err(AdmissionError::PayloadMismatch);
        }

        let charge: ChargeStatus = self
            .gateway
            .get_request_with_fallback(request_id, ctx.transaction_id.as_deref())
            .await?;

        let approved = charge.status == PaymentStatus::Approved;
        self.contexts
            .update(request_id, |ctx| {
                ctx.status = charge.status;
                ctx.last_checked_at = Some(ContextTable::now_ts());
                if let Some(tx) = charge.transaction_id.clone() {
                    ctx.transaction_id = Some(tx);
                }
                if approved {
                    ctx.approved = true;
                }
            })
            .await;

        if approved {
            tracing::info!(request_id, agent_id, "payment approved");
            Ok(AdmissionDecision::Approved {
                request_id: request_id.to_string(),
                reused: false,
            })
        } else {
            Ok(AdmissionDecision::NotReady {
                request_id: request_id.to_string(),
                status: charge.status,
                provider_request: charge.raw,
            })
        }
    }

    /// Record a successful gated execution: flip the context to consumed and
    /// capture the job/research id the tool reported, enabling the
    /// status-reuse allowlist for exactly that identifier.
    pub async fn finalize(&self, request_id: &str, tool_name: &str, result: &Value) {
        let data = result.get("data").cloned().unwrap_or(Value::Null);

        self.contexts
            .update(request_id, |ctx| {
                ctx.approved = true;
                ctx.consumed = true;
                ctx.status = PaymentStatus::Consumed;

                match tool_name {
                    "ask_heurist" => {
                        if let Some(job_id) = data.get("job_id").and_then(Value::as_str) {
                            ctx.linked_job_id = Some(job_id.to_string());
                        }
                    }
                    "caesar_research" => {
                        if let Some(research_id) = data
                            .get("data")
                            .and_then(|nested| nested.get("research_id"))
                            .and_then(Value::as_str)
                        {
                            ctx.linked_research_id = Some(research_id.to_string());
                        }
                    }
                    _ => {}
                }
            })
            .await;
    }

    /// Look up a live context (primarily for diagnostics and tests).
    pub async fn context(&self, request_id: &str) -> Option<PaymentContext> {
        self.contexts.get(request_id).await
    }
}

fn is_allowlisted_status_tool(agent_id: &str, invocation: &ToolInvocation) -> bool {
    let Some(tool) = invocation.tool.as_deref() else {
        return false;
    };
    STATUS_REUSE_ALLOWLIST.contains(&(agent_id, tool))
}

/// A status tool may reuse a charge only when the charge is approved, was
/// opened by the same payer under the same agent, and the job identifier in
/// the follow-up arguments matches the one the original paid call produced.
fn is_valid_status_reuse(
    payment: &PaymentRequest,
    agent_id: &str,
    invocation: &ToolInvocation,
    ctx: &PaymentContext,
) -> bool {
    if !is_allowlisted_status_tool(agent_id, invocation) {
        return false;
    }
    if !ctx.approved || ctx.payer_id != payment.user_id || ctx.agent_id != agent_id {
        return false;
    }

    match invocation.tool.as_deref() {
        Some("check_job_status") => {
            ctx.linked_job_id.is_some() && ctx.linked_job_id.as_deref() == invocation.arg_str("job_id")
        }
        Some("get_research_result") => {
            ctx.linked_research_id.is_some()
                && ctx.linked_research_id.as_deref() == invocation.arg_str("research_id")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::testing::StubGateway;

    fn controller(gateway: Arc<StubGateway>) -> AdmissionController {
        let config = crate::testing::payment_config();
        AdmissionController::new(gateway, &config)
    }

    fn payment(request_id: Option<&str>) -> PaymentRequest {
        PaymentRequest {
            user_id: "u1".to_string(),
            currency: "USDC".to_string(),
            request_id: request_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn first_call_opens_charge_and_returns_pending() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        let decision = ctrl
            .admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();

        match decision {
            AdmissionDecision::Pending { request_id, .. } => assert_eq!(request_id, "r1"),
            other => panic!("expected pending, got {other:?}"),
        }
        assert_eq!(gateway.create_calls(), 1);
        // 50 credits -> $0.50
        assert_eq!(gateway.last_amount(), Some(dec!(0.50)));
    }

    #[tokio::test]
    async fn small_credit_price_floors_at_one_cent() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("echo", json!({}));

        ctrl.admit(&payment(None), "EchoAgent", &invocation, dec!(0))
            .await
            .unwrap();

        assert_eq!(gateway.last_amount(), Some(dec!(0.01)));
    }

    #[tokio::test]
    async fn poll_before_approval_is_not_ready() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();

        let decision = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        match decision {
            AdmissionDecision::NotReady { status, .. } => {
                assert_eq!(status, PaymentStatus::Pending);
            }
            other => panic!("expected not-ready, got {other:?}"),
        }
        // Polling must not open another charge.
        assert_eq!(gateway.create_calls(), 1);
    }

    #[tokio::test]
    async fn idempotent_admission_after_approval() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        gateway.set_status("r1", PaymentStatus::Approved);

        for _ in 0..2 {
            let decision = ctrl
                .admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
                .await
                .unwrap();
            assert!(decision.is_approved());
        }
        assert_eq!(gateway.create_calls(), 1);
    }

    #[tokio::test]
    async fn replay_with_different_payload_is_rejected() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let original = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &original, dec!(50))
            .await
            .unwrap();
        gateway.set_status("r1", PaymentStatus::Approved);

        let tampered = ToolInvocation::new("caesar_research", json!({"query": "Y"}));
        let err = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &tampered, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::PayloadMismatch));
    }

    #[tokio::test]
    async fn different_payer_is_rejected() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();

        let mut other_payer = payment(Some("r1"));
        other_payer.user_id = "u2".to_string();
        let err = ctrl
            .admit(&other_payer, "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::IdentityMismatch));
    }

    #[tokio::test]
    async fn consumed_charge_cannot_be_respent() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        gateway.set_status("r1", PaymentStatus::Approved);
        ctrl.admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();

        ctrl.finalize("r1", "caesar_research", &json!({"data": {"data": {"research_id": "res42"}}}))
            .await;

        let err = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Consumed));
    }

    #[tokio::test]
    async fn status_reuse_allows_matching_research_id_only() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        gateway.set_status("r1", PaymentStatus::Approved);
        ctrl.admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        ctrl.finalize("r1", "caesar_research", &json!({"data": {"data": {"research_id": "res42"}}}))
            .await;

        let followup = ToolInvocation::new("get_research_result", json!({"research_id": "res42"}));
        let decision = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &followup, dec!(50))
            .await
            .unwrap();
        match decision {
            AdmissionDecision::Approved { reused, .. } => assert!(reused),
            other => panic!("expected reused approval, got {other:?}"),
        }
        // No new charge was opened for the reuse.
        assert_eq!(gateway.create_calls(), 1);

        // A different research id must not ride on the old charge: it is
        // treated as a brand-new admission and gets its own pending charge.
        let wrong = ToolInvocation::new("get_research_result", json!({"research_id": "res99"}));
        let fresh = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &wrong, dec!(50))
            .await
            .unwrap();
        match fresh {
            AdmissionDecision::Pending { request_id, .. } => assert_eq!(request_id, "r2"),
            other => panic!("expected fresh pending, got {other:?}"),
        }
        assert_eq!(gateway.create_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_request_id_is_rejected() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway);
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        let err = ctrl
            .admit(&payment(Some("nope")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownRequestId));
    }

    #[tokio::test]
    async fn non_usdc_currency_is_rejected() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway);
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        let mut pay = payment(None);
        pay.currency = "EUR".to_string();
        let err = ctrl
            .admit(&pay, "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnsupportedCurrency { .. }));
    }

    #[tokio::test]
    async fn missing_tool_and_query_input_are_rejected() {
        let gateway = Arc::new(StubGateway::new());
        let ctrl = controller(gateway);

        let no_tool = ToolInvocation {
            tool: None,
            tool_arguments: json!({}),
            query: None,
        };
        assert!(matches!(
            ctrl.admit(&payment(None), "EchoAgent", &no_tool, dec!(10)).await,
            Err(AdmissionError::MissingTool)
        ));

        let with_query = ToolInvocation {
            tool: Some("echo".to_string()),
            tool_arguments: json!({}),
            query: Some("hello".to_string()),
        };
        assert!(matches!(
            ctrl.admit(&payment(None), "EchoAgent", &with_query, dec!(10)).await,
            Err(AdmissionError::QueryNotSupported)
        ));
    }

    #[tokio::test]
    async fn approval_via_transaction_fallback() {
        let gateway = Arc::new(StubGateway::new());
        gateway.set_request_lookup_missing(true);
        let ctrl = controller(gateway.clone());
        let invocation = ToolInvocation::new("caesar_research", json!({"query": "X"}));

        ctrl.admit(&payment(None), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        // The request object is invisible, but the paid transaction exists.
        gateway.set_transaction_status("t1", "PAID");

        let decision = ctrl
            .admit(&payment(Some("r1")), "CaesarResearchAgent", &invocation, dec!(50))
            .await
            .unwrap();
        assert!(decision.is_approved());
    }
}
