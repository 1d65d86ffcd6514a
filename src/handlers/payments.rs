use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::{auth::AuthUser, errors::ApiError, AppState};
use axum::{
    extract::{Json, Query, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use validator::Validate;

/// Creates the router for checkout and payment verification.
/// The gateway webhook lives in [`crate::handlers::webhooks`].
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/initialize", post(initialize_checkout))
        .route("/verify", get(verify_payment))
}

/// Start a checkout for the caller's cart.
///
/// The payment email defaults to the account email; the body may override
/// it, for example to send the gateway receipt somewhere else.
async fn initialize_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Option<Json<InitializeCheckoutRequest>>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let email = match payload {
        Some(Json(body)) => {
            validate_input(&body)?;
            body.email.unwrap_or(user.email)
        }
        None => user.email,
    };

    let checkout = state
        .checkout_service
        .initialize_checkout(user.user_id, &email)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(checkout))
}

/// Confirm a payment by reference, settling it if the gateway agrees
async fn verify_payment(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<VerifyQuery>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let payment = state
        .checkout_service
        .verify_payment(&query.reference)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(payment))
}

/// Optional overrides for checkout initialization
#[derive(Debug, Default, Deserialize, Validate)]
pub struct InitializeCheckoutRequest {
    #[validate(email)]
    pub email: Option<String>,
}

/// Query parameters for payment verification
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub reference: String,
}
