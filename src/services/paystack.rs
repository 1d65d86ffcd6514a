use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument, warn};

use crate::errors::ServiceError;

/// Converts a major-unit amount to the gateway's integer minor units
/// (major x 100, truncated). Returns `None` when the amount does not
/// fit in an i64.
pub fn minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::from(100)).trunc().to_i64()
}

/// Successful `transaction/initialize` payload: where to send the buyer
/// and the reference the gateway will echo back.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializedTransaction {
    pub authorization_url: String,
    pub access_code: Option<String>,
    pub reference: String,
}

/// `transaction/verify` payload. The transaction is settled iff
/// `status` is exactly `"success"`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedTransaction {
    pub status: String,
    pub reference: String,
    pub amount: Option<i64>,
}

impl VerifiedTransaction {
    pub fn is_successful(&self) -> bool {
        self.status == "success"
    }
}

/// Gateway response envelope: `status` is the gateway's own ok flag,
/// not the HTTP status.
#[derive(Debug, Deserialize)]
struct GatewayEnvelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeRequest<'a> {
    email: &'a str,
    amount: i64,
    reference: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    transaction: &'a str,
    merchant_note: &'a str,
}

/// Outbound payment gateway operations used by the checkout workflow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a gateway transaction for the given amount (major units)
    /// and returns the redirect handle.
    async fn initialize_transaction(
        &self,
        email: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<InitializedTransaction, ServiceError>;

    /// Fetches the gateway's view of a transaction by reference.
    async fn verify_transaction(&self, reference: &str)
        -> Result<VerifiedTransaction, ServiceError>;

    /// Best-effort refund request; the merchant note records why.
    async fn request_refund(
        &self,
        reference: &str,
        merchant_note: &str,
    ) -> Result<(), ServiceError>;
}

/// Paystack REST client. The base URL is configurable so tests can
/// point it at a mock server.
#[derive(Clone)]
pub struct PaystackClient {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl PaystackClient {
    pub fn new(secret_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
        }
    }

    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Paystack {} returned HTTP {}: {}",
                operation, status, body
            );
            return Err(ServiceError::ExternalServiceError(format!(
                "paystack {} returned HTTP {}",
                operation, status
            )));
        }

        let envelope: GatewayEnvelope<T> = response.json().await.map_err(|e| {
            error!("Malformed Paystack {} response: {}", operation, e);
            ServiceError::ExternalServiceError(format!(
                "malformed paystack {} response: {}",
                operation, e
            ))
        })?;

        if !envelope.status {
            let message = envelope
                .message
                .unwrap_or_else(|| "gateway reported failure".to_string());
            warn!("Paystack {} rejected: {}", operation, message);
            return Err(ServiceError::ExternalServiceError(format!(
                "paystack {} rejected: {}",
                operation, message
            )));
        }

        envelope.data.ok_or_else(|| {
            ServiceError::ExternalServiceError(format!(
                "paystack {} response missing data",
                operation
            ))
        })
    }
}

#[async_trait]
impl PaymentGateway for PaystackClient {
    #[instrument(skip(self))]
    async fn initialize_transaction(
        &self,
        email: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<InitializedTransaction, ServiceError> {
        let amount_minor = minor_units(amount).ok_or_else(|| {
            ServiceError::ValidationError(format!("amount {} out of range", amount))
        })?;

        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&InitializeRequest {
                email,
                amount: amount_minor,
                reference,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Paystack initialize request failed: {}", e);
                ServiceError::ExternalServiceError(format!(
                    "paystack initialize request failed: {}",
                    e
                ))
            })?;

        Self::parse_envelope("initialize", response).await
    }

    #[instrument(skip(self))]
    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<VerifiedTransaction, ServiceError> {
        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| {
                error!("Paystack verify request failed: {}", e);
                ServiceError::ExternalServiceError(format!(
                    "paystack verify request failed: {}",
                    e
                ))
            })?;

        Self::parse_envelope("verify", response).await
    }

    #[instrument(skip(self))]
    async fn request_refund(
        &self,
        reference: &str,
        merchant_note: &str,
    ) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(format!("{}/refund", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&RefundRequest {
                transaction: reference,
                merchant_note,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Paystack refund request failed: {}", e);
                ServiceError::ExternalServiceError(format!(
                    "paystack refund request failed: {}",
                    e
                ))
            })?;

        // Refund data payload is not used; only the accept/reject signal matters
        Self::parse_envelope::<serde_json::Value>("refund", response)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn minor_units_truncates_toward_zero() {
        assert_eq!(minor_units(dec!(12.34)), Some(1234));
        assert_eq!(minor_units(dec!(10)), Some(1000));
        assert_eq!(minor_units(dec!(0.999)), Some(99));
        assert_eq!(minor_units(dec!(0)), Some(0));
    }

    #[tokio::test]
    async fn initialize_sends_minor_units_and_parses_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction/initialize"))
            .and(header("authorization", "Bearer sk_test_abc"))
            .and(body_partial_json(json!({
                "email": "buyer@example.com",
                "amount": 250050,
                "reference": "CHIMES-DEV-1-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": true,
                "message": "Authorization URL created",
                "data": {
                    "authorization_url": "https://checkout.paystack.com/abc123",
                    "access_code": "abc123",
                    "reference": "CHIMES-DEV-1-1"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = PaystackClient::new("sk_test_abc".into(), server.uri());
        let init = client
            .initialize_transaction("buyer@example.com", dec!(2500.50), "CHIMES-DEV-1-1")
            .await
            .expect("initialize should succeed");

        assert_eq!(
            init.authorization_url,
            "https://checkout.paystack.com/abc123"
        );
        assert_eq!(init.reference, "CHIMES-DEV-1-1");
    }

    #[tokio::test]
    async fn initialize_maps_http_failure_to_external_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction/initialize"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = PaystackClient::new("sk_test_abc".into(), server.uri());
        let err = client
            .initialize_transaction("buyer@example.com", dec!(10), "REF-1")
            .await
            .expect_err("503 must fail");

        assert!(matches!(err, ServiceError::ExternalServiceError(_)));
    }

    #[tokio::test]
    async fn initialize_maps_gateway_rejection_to_external_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction/initialize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": false,
                "message": "Invalid key"
            })))
            .mount(&server)
            .await;

        let client = PaystackClient::new("sk_bad".into(), server.uri());
        let err = client
            .initialize_transaction("buyer@example.com", dec!(10), "REF-1")
            .await
            .expect_err("rejected envelope must fail");

        assert!(matches!(err, ServiceError::ExternalServiceError(_)));
    }

    #[tokio::test]
    async fn verify_reports_gateway_transaction_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transaction/verify/CHIMES-DEV-9-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": true,
                "message": "Verification successful",
                "data": {
                    "status": "abandoned",
                    "reference": "CHIMES-DEV-9-9",
                    "amount": 5000
                }
            })))
            .mount(&server)
            .await;

        let client = PaystackClient::new("sk_test_abc".into(), server.uri());
        let verified = client
            .verify_transaction("CHIMES-DEV-9-9")
            .await
            .expect("verify should succeed");

        assert_eq!(verified.status, "abandoned");
        assert!(!verified.is_successful());
    }

    #[tokio::test]
    async fn refund_posts_reference_and_note() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refund"))
            .and(body_partial_json(json!({
                "transaction": "CHIMES-DEV-5-5",
                "merchant_note": "stock shortage"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": true,
                "message": "Refund has been queued for processing",
                "data": { "id": 101 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = PaystackClient::new("sk_test_abc".into(), server.uri());
        client
            .request_refund("CHIMES-DEV-5-5", "stock shortage")
            .await
            .expect("refund should succeed");
    }
}
