//! Payment admission control.
//!
//! Gates metered tool execution behind a two-phase charge protocol against
//! an external payment provider, binds every charge to one exact tool
//! payload, and allows a narrow allowlist of follow-up status checks to
//! reuse an approved charge. See [`AdmissionController`].

mod admission;
mod context;
mod provider;
mod signup;

pub use admission::{AdmissionController, AdmissionDecision, PaymentRequest, ToolInvocation};
pub use context::{ContextTable, PaymentContext, hash_request_payload};
pub use provider::{
    AttachDetails, ChargeStatus, CreatedCharge, HttpPaymentGateway, PaymentGateway, PaymentStatus,
    RequestSource, TransactionRecord,
};
pub use signup::{
    SignupRateLimiter, SignupService, client_ip_from_forwarded, validate_attach_password,
};
