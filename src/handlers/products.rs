use crate::handlers::common::{
    created_response, default_page, default_per_page, map_service_error, no_content_response,
    success_response, validate_input, PaginatedResponse,
};
use crate::{
    auth::AdminUser,
    errors::ApiError,
    services::products::{NewProduct, ProductPatch},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    routing::get,
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for product endpoints. Reads are public, writes
/// need the admin role.
pub fn products_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route(
            "/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
}

/// List products, optionally filtered by search term
async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductListQuery>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let (products, total) = state
        .product_service
        .list_products(query.search, query.page, query.per_page)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(PaginatedResponse::new(
        products,
        query.page,
        query.per_page,
        total,
    )))
}

/// Get a single product
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let product = state
        .product_service
        .get_product(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}

/// Create a product (admin only)
async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CreateProductRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let product = state
        .product_service
        .create_product(NewProduct {
            name: payload.name,
            description: payload.description,
            price: payload.price,
            stock: payload.stock,
        })
        .await
        .map_err(map_service_error)?;

    Ok(created_response(product))
}

/// Partially update a product (admin only)
async fn update_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateProductRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let product = state
        .product_service
        .update_product(
            id,
            ProductPatch {
                name: payload.name,
                description: payload.description,
                price: payload.price,
                stock: payload.stock,
            },
        )
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}

/// Delete a product (admin only)
async fn delete_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .product_service
        .delete_product(id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Query parameters for listing products
#[derive(Debug, Deserialize)]
pub struct ProductListQuery {
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

/// Create product request payload
#[derive(Debug, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, message = "name must not be empty"))]
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub stock: i32,
}

/// Partial product update payload
#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub stock: Option<i32>,
}
