#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    routing::get,
    Router,
};
use chimes_api::{
    auth::{AuthConfig, AuthService, AuthSession, SignupInput},
    config::AppConfig,
    db,
    entities::product,
    events::{self, EventSender},
    services::{CartService, CheckoutService, PaymentGateway, PaystackClient, ProductService},
    AppState,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

/// Secret shared by the mocked gateway client and the webhook signature
/// checks, mirroring how Paystack signs webhooks with the API secret.
pub const TEST_PAYSTACK_SECRET: &str = "sk_test_chimes_integration_only";

/// Signup key that grants the admin role in tests.
pub const TEST_ADMIN_SIGNUP_KEY: &str = "chimes-test-admin-key";

/// Reference prefix used by checkouts started through the harness.
pub const TEST_REFERENCE_PREFIX: &str = "CHIMES-TEST";

/// Helper harness for spinning up an application backed by a throwaway
/// SQLite database and a mock Paystack server.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub paystack: MockServer,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: TempDir,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("chimes_test.db");

        let paystack = MockServer::start().await;

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "integration_test_jwt_secret_with_plenty_of_entropy_9876543210_qwerty".to_string(),
            TEST_PAYSTACK_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.paystack_base_url = paystack.uri();
        cfg.payment_reference_prefix = TEST_REFERENCE_PREFIX.to_string();
        cfg.admin_signup_key = Some(TEST_ADMIN_SIGNUP_KEY.to_string());

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let shared_sender = Arc::new(event_sender.clone());
        let auth_service = Arc::new(AuthService::new(
            AuthConfig::from_app_config(&cfg),
            db_arc.clone(),
            shared_sender.clone(),
        ));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(PaystackClient::new(
            cfg.paystack_secret_key.clone(),
            cfg.paystack_base_url.clone(),
        ));
        let product_service = ProductService::new(db_arc.clone(), shared_sender.clone());
        let cart_service = CartService::new(db_arc.clone(), shared_sender.clone());
        let checkout_service = CheckoutService::new(
            db_arc.clone(),
            gateway,
            shared_sender.clone(),
            cfg.payment_reference_prefix.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            auth_service,
            product_service,
            cart_service,
            checkout_service,
        };

        let router = Router::new()
            .route("/health", get(chimes_api::health_check))
            .nest("/api/v1", chimes_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            paystack,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    /// Register an account through the auth service and return its session.
    pub async fn signup(&self, email: &str, password: &str) -> AuthSession {
        self.state
            .auth_service
            .signup(SignupInput {
                email: email.to_string(),
                password: password.to_string(),
                admin_key: None,
            })
            .await
            .expect("signup test account")
    }

    /// Register an account with the shared admin key, granting the admin role.
    pub async fn signup_admin(&self, email: &str, password: &str) -> AuthSession {
        self.state
            .auth_service
            .signup(SignupInput {
                email: email.to_string(),
                password: password.to_string(),
                admin_key: Some(TEST_ADMIN_SIGNUP_KEY.to_string()),
            })
            .await
            .expect("signup admin test account")
    }

    /// Insert a product directly, bypassing the admin-gated handler.
    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(Some(format!("{} seeded for integration tests", name))),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("seed product for tests")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a request whose exact body bytes matter, with explicit headers.
    /// Used by webhook tests where the signature covers the raw payload.
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: String,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = builder
            .body(Body::from(body))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}
