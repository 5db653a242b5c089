//! Payment provider REST client.
//!
//! The provider speaks a two-phase charge protocol: `POST /v1/requests/payment`
//! opens a charge, `GET /v1/requests/{id}` polls it. Some accounts can see
//! transaction records but not request objects, so request lookup falls back
//! to `GET /v1/transactions/{id}` and a bounded scan of recent transactions.
//!
//! Responses are parsed once here into typed records; business logic never
//! probes raw JSON keys.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{Value, json};

use crate::config::PaymentConfig;
use crate::error::GatewayError;

/// Best-effort page size for the approval-id transaction scan. A matching
/// transaction paginated out of this window is reported as a lookup failure,
/// never approved.
const TRANSACTION_SCAN_LIMIT: usize = 20;

/// Charge lifecycle status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Approved,
    Declined,
    Expired,
    Cancelled,
    /// Set locally once the gated tool call has executed. The provider never
    /// returns this value.
    Consumed,
}

impl PaymentStatus {
    /// Parse a provider request status. Unknown strings are treated as
    /// still-pending rather than terminal.
    pub fn from_provider(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "APPROVED" => Self::Approved,
            "DECLINED" => Self::Declined,
            "EXPIRED" => Self::Expired,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Derive a request status from a transaction status. Transactions use a
    /// wider vocabulary than requests.
    pub fn from_transaction_status(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "APPROVED" | "PAID" | "POLICY_APPROVED" => Self::Approved,
            "DECLINED" | "POLICY_DECLINED" => Self::Declined,
            "EXPIRED" => Self::Expired,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Declined => "DECLINED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
            Self::Consumed => "CONSUMED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request status record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// `GET /v1/requests/{id}` answered directly.
    Direct,
    /// Synthesized from a transaction record because request lookup was
    /// unavailable for this account.
    TransactionFallback,
}

/// A freshly opened charge.
#[derive(Debug, Clone)]
pub struct CreatedCharge {
    pub request_id: String,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    /// Raw provider body, passed through to callers for display.
    pub raw: Value,
}

/// Current state of a charge request.
#[derive(Debug, Clone)]
pub struct ChargeStatus {
    pub request_id: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub source: RequestSource,
    /// Raw provider body, passed through to callers for display.
    pub raw: Value,
}

/// A provider transaction record.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub raw: Value,
}

/// User details for attaching credentials to an agentic account.
#[derive(Debug, Clone)]
pub struct AttachDetails {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

/// Seam to the external payment provider.
///
/// Implemented over HTTP by [`HttpPaymentGateway`]; tests inject stubs.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a charge for `amount_usd` against the payer's account.
    async fn create_charge(
        &self,
        user_id: &str,
        amount_usd: Decimal,
        currency: &str,
    ) -> Result<CreatedCharge, GatewayError>;

    /// Direct request-status lookup.
    async fn get_request(&self, request_id: &str) -> Result<ChargeStatus, GatewayError>;

    /// Point lookup of a transaction; `None` when the provider has no record.
    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError>;

    /// Scan recent transactions for one whose `approvalId` matches.
    ///
    /// Best effort: bounded to [`TRANSACTION_SCAN_LIMIT`] records, so a match
    /// outside the window is reported as absent.
    async fn find_transaction_by_approval_id(
        &self,
        approval_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError>;

    /// Create a bare agentic user (locale/timezone only).
    async fn signup_agentic_user(
        &self,
        locale: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Value, GatewayError>;

    /// Attach login details to an agentic user, authenticated with the
    /// user's own private key rather than the service key.
    async fn attach_agentic_user(
        &self,
        private_key: &str,
        details: &AttachDetails,
    ) -> Result<Value, GatewayError>;

    /// Request-status lookup with the transaction fallback.
    ///
    /// When direct lookup 404s with `APPROVAL_NOT_FOUND`, the charge is
    /// located via its recorded transaction id, then via the approval-id
    /// scan, and an equivalent status record is synthesized from whichever
    /// transaction was found.
    async fn get_request_with_fallback(
        &self,
        request_id: &str,
        transaction_id_hint: Option<&str>,
    ) -> Result<ChargeStatus, GatewayError> {
        let direct_err = match self.get_request(request_id).await {
            Ok(status) => return Ok(status),
            Err(err) => err,
        };

        let eligible = matches!(
            &direct_err,
            GatewayError::Rejected { status: 404, body, .. }
                if provider_error_codes(body).contains("APPROVAL_NOT_FOUND")
        );
        if !eligible {
            return Err(direct_err);
        }

        let mut tx = None;
        if let Some(id) = transaction_id_hint {
            tx = self.get_transaction(id).await?;
        }
        if tx.is_none() {
            tx = self.find_transaction_by_approval_id(request_id).await?;
        }

        match tx {
            Some(tx) => {
                tracing::debug!(
                    request_id,
                    status = %tx.status,
                    "synthesized request status from transaction record"
                );
                Ok(ChargeStatus {
                    request_id: request_id.to_string(),
                    status: tx.status,
                    transaction_id: tx.transaction_id.clone(),
                    source: RequestSource::TransactionFallback,
                    raw: json!({
                        "requestId": request_id,
                        "status": tx.status.as_str(),
                        "transactionId": tx.transaction_id,
                        "source": "transaction_fallback",
                        "transaction": tx.raw,
                    }),
                })
            }
            None => Err(direct_err),
        }
    }
}

/// Extract machine-readable error codes from a provider error body.
pub(crate) fn provider_error_codes(body: &Value) -> HashSet<String> {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("code").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// HTTP implementation of [`PaymentGateway`].
pub struct HttpPaymentGateway {
    client: Client,
    config: PaymentConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: PaymentConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Issue a request with the service key, returning `(status, body)`.
    /// Non-JSON bodies are wrapped as `{"raw": text}` so error reporting
    /// never loses the provider's output.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        api_key: &str,
        json_body: Option<&Value>,
    ) -> Result<(u16, Value), GatewayError> {
        let url = self.url(path);
        tracing::debug!(%method, %url, "payment provider request");

        let mut req = self
            .client
            .request(method, &url)
            .header("X-API-Key", api_key)
            .header("Content-Type", "application/json");
        if let Some(body) = json_body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| GatewayError::Unavailable {
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(other) => json!({ "raw": other }),
            Err(_) => json!({ "raw": text }),
        };
        tracing::debug!(%url, status, "payment provider response");
        Ok((status, body))
    }

    async fn service_request(
        &self,
        method: reqwest::Method,
        path: &str,
        json_body: Option<&Value>,
    ) -> Result<(u16, Value), GatewayError> {
        self.request(method, path, self.config.api_key(), json_body)
            .await
    }

    fn reject(status: u16, message: &str, body: Value) -> GatewayError {
        if status >= 500 {
            GatewayError::Unavailable {
                reason: format!("{message} (HTTP {status}): {body}"),
            }
        } else {
            GatewayError::Rejected {
                status,
                message: message.to_string(),
                body,
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_charge(
        &self,
        user_id: &str,
        amount_usd: Decimal,
        currency: &str,
    ) -> Result<CreatedCharge, GatewayError> {
        let payload = json!({
            "userId": user_id,
            "amount": amount_usd,
            "currency": currency,
            "display": "HEADLESS",
            "userDetails": [],
        });

        let (status, body) = self
            .service_request(reqwest::Method::POST, "/v1/requests/payment", Some(&payload))
            .await?;
        if status != 200 {
            return Err(Self::reject(status, "failed to create payment request", body));
        }

        let request_id = body
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidResponse {
                reason: format!("create response missing requestId: {body}"),
            })?;

        Ok(CreatedCharge {
            request_id,
            transaction_id: body
                .get("transactionId")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .map(PaymentStatus::from_provider)
                .unwrap_or(PaymentStatus::Pending),
            raw: body,
        })
    }

    async fn get_request(&self, request_id: &str) -> Result<ChargeStatus, GatewayError> {
        let (status, body) = self
            .service_request(reqwest::Method::GET, &format!("/v1/requests/{request_id}"), None)
            .await?;
        if status != 200 {
            return Err(Self::reject(status, "failed to fetch payment request status", body));
        }

        Ok(ChargeStatus {
            request_id: request_id.to_string(),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .map(PaymentStatus::from_provider)
                .unwrap_or(PaymentStatus::Pending),
            transaction_id: body
                .get("transactionId")
                .and_then(Value::as_str)
                .map(str::to_string),
            source: RequestSource::Direct,
            raw: body,
        })
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError> {
        let (status, body) = self
            .service_request(
                reqwest::Method::GET,
                &format!("/v1/transactions/{transaction_id}"),
                None,
            )
            .await?;
        if status != 200 {
            return Ok(None);
        }

        Ok(Some(transaction_record(body)))
    }

    async fn find_transaction_by_approval_id(
        &self,
        approval_id: &str,
    ) -> Result<Option<TransactionRecord>, GatewayError> {
        let (status, body) = self
            .service_request(
                reqwest::Method::GET,
                &format!("/v1/transactions?limit={TRANSACTION_SCAN_LIMIT}"),
                None,
            )
            .await?;
        if status != 200 {
            return Ok(None);
        }

        let found = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| {
                        item.get("approvalId").and_then(Value::as_str) == Some(approval_id)
                    })
                    .cloned()
            });

        Ok(found.map(transaction_record))
    }

    async fn signup_agentic_user(
        &self,
        locale: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut payload = serde_json::Map::new();
        if let Some(locale) = locale {
            payload.insert("locale".to_string(), Value::from(locale));
        }
        if let Some(timezone) = timezone {
            payload.insert("timezone".to_string(), Value::from(timezone));
        }

        let (status, body) = self
            .service_request(
                reqwest::Method::POST,
                "/v1/users/agentic",
                Some(&Value::Object(payload)),
            )
            .await?;
        if status != 200 {
            return Err(Self::reject(status, "failed to create agentic user", body));
        }
        Ok(body)
    }

    async fn attach_agentic_user(
        &self,
        private_key: &str,
        details: &AttachDetails,
    ) -> Result<Value, GatewayError> {
        let payload = json!({
            "email": details.email,
            "firstName": details.first_name,
            "lastName": details.last_name,
            "password": details.password,
        });

        let (status, body) = self
            .request(
                reqwest::Method::POST,
                "/v1/users/agentic/attach",
                private_key,
                Some(&payload),
            )
            .await?;
        if status != 200 {
            return Err(Self::reject(status, "failed to attach agentic user details", body));
        }
        Ok(body)
    }
}

fn transaction_record(body: Value) -> TransactionRecord {
    TransactionRecord {
        transaction_id: body
            .get("transactionId")
            .and_then(Value::as_str)
            .map(str::to_string),
        status: body
            .get("status")
            .and_then(Value::as_str)
            .map(PaymentStatus::from_transaction_status)
            .unwrap_or(PaymentStatus::Pending),
        raw: body,
    }
}
