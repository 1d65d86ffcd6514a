use crate::handlers::common::{map_service_error, no_content_response, success_response, validate_input};
use crate::{
    auth::AuthUser,
    errors::ApiError,
    services::carts::{AddToCartInput, CartLineInput},
    AppState,
};
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for the authenticated user's cart
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).put(replace_cart).delete(clear_cart))
        .route("/items", post(add_item))
}

/// Fetch the caller's cart with product details
async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .cart_service
        .get_cart(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Add a product to the caller's cart
async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .cart_service
        .add_item(
            user.user_id,
            AddToCartInput {
                product_id: payload.product_id,
                quantity: payload.quantity,
            },
        )
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Replace the caller's cart contents wholesale
async fn replace_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ReplaceCartRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let lines = payload
        .items
        .into_iter()
        .map(|line| CartLineInput {
            product_id: line.product_id,
            quantity: line.quantity,
        })
        .collect();

    let cart = state
        .cart_service
        .replace_items(user.user_id, lines)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Remove every line from the caller's cart
async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .cart_service
        .clear_cart(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Add item request payload
#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: i32,
}

/// Wholesale cart replacement payload
#[derive(Debug, Deserialize)]
pub struct ReplaceCartRequest {
    pub items: Vec<CartLineRequest>,
}

/// One line of a cart replacement
#[derive(Debug, Deserialize)]
pub struct CartLineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}
