use crate::{errors::ServiceError, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use tracing::{info, warn};

type HmacSha512 = Hmac<Sha512>;

const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Creates the router for gateway webhooks. No bearer auth; the HMAC
/// signature is the authentication.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(paystack_webhook))
}

/// Receive a Paystack event.
///
/// The signature is an HMAC-SHA512 of the raw body under the same secret
/// key used for API calls, and it is checked before the body is parsed.
/// Everything after a valid signature answers 200 so the gateway stops
/// redelivering, except infrastructure failures, which answer 5xx on
/// purpose to get the event redelivered.
async fn paystack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("Webhook arrived without a signature header");
            ServiceError::Unauthorized("missing webhook signature".to_string())
        })?;

    if !verify_signature(&state.config.paystack_secret_key, &body, signature) {
        warn!("Webhook signature verification failed");
        return Err(ServiceError::Unauthorized(
            "invalid webhook signature".to_string(),
        ));
    }

    // The sender is authenticated at this point, so an unusable body is
    // the gateway's shape problem, not something a retry will fix.
    // Acknowledge it instead of triggering redelivery.
    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Signed webhook body did not parse, acknowledging");
            return Ok(StatusCode::OK);
        }
    };

    match event.event.as_str() {
        "charge.success" => {
            let Some(reference) = event.data.and_then(|data| data.reference) else {
                warn!("charge.success without a reference, acknowledging");
                return Ok(StatusCode::OK);
            };
            state
                .checkout_service
                .reconcile_successful_charge(&reference)
                .await?;
        }
        other => {
            info!(event = other, "Ignoring unhandled webhook event type");
        }
    }

    Ok(StatusCode::OK)
}

fn verify_signature(secret: &str, payload: &[u8], provided: &str) -> bool {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    let provided = provided.trim().to_ascii_lowercase();
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The slice of a Paystack event envelope this service cares about
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub reference: Option<String>,
}
