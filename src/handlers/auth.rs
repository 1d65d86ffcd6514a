use crate::handlers::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    auth::{AuthUser, LoginInput, SignupInput},
    errors::ApiError,
    AppState,
};
use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

/// Creates the router for authentication endpoints
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
}

/// Register a new account and hand back a token pair
async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let session = state
        .auth_service
        .signup(SignupInput {
            email: payload.email,
            password: payload.password,
            admin_key: payload.admin_key,
        })
        .await
        .map_err(map_service_error)?;

    Ok(created_response(session))
}

/// Exchange credentials for a token pair
async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let session = state
        .auth_service
        .login(LoginInput {
            email: payload.email,
            password: payload.password,
        })
        .await
        .map_err(map_service_error)?;

    Ok(success_response(session))
}

/// Rotate a refresh token into a fresh pair
async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let tokens = state
        .auth_service
        .refresh(&payload.refresh_token)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(tokens))
}

/// Invalidate the caller's outstanding refresh token
async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .auth_service
        .logout(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(json!({ "message": "logged out" })))
}

/// Signup request payload
#[derive(Debug, Deserialize, Validate)]
pub struct SignupRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, message = "password must be at least 8 characters"))]
    pub password: String,
    pub admin_key: Option<String>,
}

/// Login request payload
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
}

/// Refresh request payload
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}
