//! End-to-end payment admission flow.
//!
//! Drives the full lifecycle against a scripted provider stub: open a
//! charge, poll it, approve it, execute, then ride the status-reuse
//! allowlist for the follow-up result fetch. Also covers the signup
//! passthrough with its per-IP rate limit.

use std::sync::Arc;

use rust_decimal_macros::dec;
use serde_json::json;

use meshgate::error::SignupError;
use meshgate::payment::{
    AdmissionController, AdmissionDecision, PaymentRequest, PaymentStatus, SignupService,
    ToolInvocation,
};
use meshgate::testing::{StubGateway, init_tracing, payment_config};

fn payment(request_id: Option<&str>) -> PaymentRequest {
    PaymentRequest {
        user_id: "payer-1".to_string(),
        currency: "USDC".to_string(),
        request_id: request_id.map(str::to_string),
    }
}

#[tokio::test]
async fn research_call_lifecycle_with_status_reuse() {
    init_tracing();
    let gateway = Arc::new(StubGateway::new());
    let config = payment_config();
    let ctrl = AdmissionController::new(gateway.clone(), &config);

    let research = ToolInvocation::new("caesar_research", json!({"query": "tokenomics of X"}));

    // 1. First call opens a pending charge priced from the agent's credits.
    let opened = ctrl
        .admit(&payment(None), "CaesarResearchAgent", &research, dec!(150))
        .await
        .unwrap();
    let request_id = match opened {
        AdmissionDecision::Pending { request_id, .. } => request_id,
        other => panic!("expected pending, got {other:?}"),
    };
    assert_eq!(request_id, "r1");
    // 150 credits -> $1.50
    assert_eq!(gateway.last_amount(), Some(dec!(1.50)));

    // 2. Polling before user approval does not bill again.
    let polled = ctrl
        .admit(&payment(Some(&request_id)), "CaesarResearchAgent", &research, dec!(150))
        .await
        .unwrap();
    match polled {
        AdmissionDecision::NotReady { status, .. } => assert_eq!(status, PaymentStatus::Pending),
        other => panic!("expected not-ready, got {other:?}"),
    }
    assert_eq!(gateway.create_calls(), 1);

    // 3. After approval the exact same call is admitted.
    gateway.set_status(&request_id, PaymentStatus::Approved);
    let admitted = ctrl
        .admit(&payment(Some(&request_id)), "CaesarResearchAgent", &research, dec!(150))
        .await
        .unwrap();
    assert!(admitted.is_approved());

    // 4. The tool ran and reported the research job it started.
    ctrl.finalize(
        &request_id,
        "caesar_research",
        &json!({"data": {"data": {"research_id": "res-777"}}}),
    )
    .await;
    let ctx = ctrl.context(&request_id).await.unwrap();
    assert!(ctx.consumed);
    assert_eq!(ctx.linked_research_id.as_deref(), Some("res-777"));

    // 5. Fetching the result of that exact job reuses the charge for free.
    let fetch = ToolInvocation::new("get_research_result", json!({"research_id": "res-777"}));
    let reused = ctrl
        .admit(&payment(Some(&request_id)), "CaesarResearchAgent", &fetch, dec!(150))
        .await
        .unwrap();
    match reused {
        AdmissionDecision::Approved { reused, .. } => assert!(reused),
        other => panic!("expected reused approval, got {other:?}"),
    }
    assert_eq!(gateway.create_calls(), 1);

    // 6. Fetching a job this charge never started is billed as a new call.
    let other_fetch = ToolInvocation::new("get_research_result", json!({"research_id": "res-999"}));
    let fresh = ctrl
        .admit(&payment(Some(&request_id)), "CaesarResearchAgent", &other_fetch, dec!(150))
        .await
        .unwrap();
    match fresh {
        AdmissionDecision::Pending { request_id, .. } => assert_eq!(request_id, "r2"),
        other => panic!("expected fresh pending, got {other:?}"),
    }
    assert_eq!(gateway.create_calls(), 2);
}

#[tokio::test]
async fn approval_still_lands_when_request_lookup_is_blind() {
    // Some provider accounts can read transaction records but not request
    // objects; approval must still come through via the fallback.
    init_tracing();
    let gateway = Arc::new(StubGateway::new());
    gateway.set_request_lookup_missing(true);
    let config = payment_config();
    let ctrl = AdmissionController::new(gateway.clone(), &config);

    let invocation = ToolInvocation::new("ask_heurist", json!({"question": "gm"}));
    let opened = ctrl
        .admit(&payment(None), "AskHeuristAgent", &invocation, dec!(20))
        .await
        .unwrap();
    let request_id = match opened {
        AdmissionDecision::Pending { request_id, .. } => request_id,
        other => panic!("expected pending, got {other:?}"),
    };

    gateway.set_transaction_status("t1", "PAID");

    let admitted = ctrl
        .admit(&payment(Some(&request_id)), "AskHeuristAgent", &invocation, dec!(20))
        .await
        .unwrap();
    assert!(admitted.is_approved());
}

#[tokio::test]
async fn signup_passthrough_is_rate_limited_per_ip() {
    init_tracing();
    let gateway = Arc::new(StubGateway::new());
    let config = payment_config();
    let service = SignupService::new(gateway, &config);

    let body = service
        .signup("198.51.100.7", Some("en-US"), Some("UTC"))
        .await
        .unwrap();
    assert_eq!(body["privateKey"], "stub-private-key");

    let err = service
        .signup("198.51.100.7", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SignupError::RateLimited { .. }));

    // A different client is unaffected.
    service.signup("203.0.113.9", None, None).await.unwrap();
}
