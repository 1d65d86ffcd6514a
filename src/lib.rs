//! Chimes API Library
//!
//! This crate provides the core functionality for the Chimes commerce API:
//! a product catalog, per-user carts, and a Paystack-backed checkout flow
//! whose payments are reconciled either by synchronous verification or by
//! signed gateway webhooks.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod rate_limiter;
pub mod services;

use axum::{
    extract::{FromRef, State},
    response::Json,
    routing::get,
    Router,
};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::AuthService;
use crate::services::{CartService, CheckoutService, ProductService};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub auth_service: Arc<AuthService>,
    pub product_service: ProductService,
    pub cart_service: CartService,
    pub checkout_service: CheckoutService,
}

// The auth extractors pull the service straight out of whatever state the
// router carries, so tests can run them against a minimal substate.
impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth_service.clone()
    }
}

/// Versioned API surface.
///
/// The webhook route is merged into the payments namespace rather than
/// nested separately so the gateway-facing path stays under
/// `/payments/webhook`; it authenticates by signature, not by bearer token.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Status and health endpoints
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        // Accounts and tokens
        .nest("/auth", handlers::auth::auth_routes())
        // Catalog
        .nest("/products", handlers::products::products_routes())
        // Per-user cart
        .nest("/cart", handlers::carts::cart_routes())
        // Checkout, verification, and the gateway webhook
        .nest(
            "/payments",
            handlers::payments::payment_routes().merge(handlers::webhooks::webhook_routes()),
        )
}

async fn api_status() -> Json<Value> {
    let version = env!("CARGO_PKG_VERSION");
    Json(json!({
        "status": "ok",
        "service": "chimes-api",
        "version": version,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    // Check database connectivity
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Json(json!({
        "status": db_status,
        "checks": {
            "database": db_status,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
