//! Integration tests for the Paystack webhook endpoint.
//!
//! Tests cover:
//! - Signature verification (missing, wrong-key, tampered payloads)
//! - Settlement through charge.success events
//! - Idempotent replays and unknown references
//! - The refund path when stock ran out before the charge landed

mod common;

use axum::http::Method;
use chimes_api::entities::{payment, product, Payment, Product};
use common::{TestApp, TEST_PAYSTACK_SECRET};
use hmac::{Hmac, Mac};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::json;
use sha2::Sha512;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type HmacSha512 = Hmac<Sha512>;

fn sign_with(key: &str, payload: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn charge_success_payload(reference: &str) -> String {
    json!({
        "event": "charge.success",
        "data": {
            "reference": reference,
            "amount": 3998,
            "status": "success"
        }
    })
    .to_string()
}

async fn deliver(
    app: &TestApp,
    payload: &str,
    signature: Option<&str>,
) -> axum::response::Response {
    let mut headers: Vec<(&str, &str)> = vec![("content-type", "application/json")];
    if let Some(signature) = signature {
        headers.push(("x-paystack-signature", signature));
    }
    app.request_raw(
        Method::POST,
        "/api/v1/payments/webhook",
        payload.to_string(),
        &headers,
    )
    .await
}

async fn mock_initialize_success(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/transaction/initialize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Authorization URL created",
            "data": {
                "authorization_url": "https://checkout.paystack.com/mock",
                "access_code": "mock_access",
                "reference": "echoed-by-gateway"
            }
        })))
        .mount(server)
        .await;
}

/// Sign up a buyer, put `quantity` of the product in their cart, and start
/// a checkout. Returns the buyer's token and the payment reference.
async fn pending_checkout(app: &TestApp, product: &product::Model, quantity: i32) -> (String, String) {
    let session = app.signup("buyer@chimes.test", "orchestra-pit-42").await;
    let token = session.tokens.access_token.clone();

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id, "quantity": quantity })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), 200);

    mock_initialize_success(&app.paystack).await;
    let response = app
        .request(Method::POST, "/api/v1/payments/initialize", None, Some(&token))
        .await;
    assert_eq!(response.status(), 200);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json response");
    let reference = body["reference"].as_str().expect("reference").to_string();
    (token, reference)
}

async fn payment_by_reference(app: &TestApp, reference: &str) -> payment::Model {
    Payment::find()
        .filter(payment::Column::Reference.eq(reference))
        .one(app.state.db.as_ref())
        .await
        .expect("query payment")
        .expect("payment row exists")
}

async fn stock_of(app: &TestApp, id: uuid::Uuid) -> i32 {
    Product::find_by_id(id)
        .one(app.state.db.as_ref())
        .await
        .expect("query product")
        .expect("product exists")
        .stock
}

// ==================== Signature Tests ====================

#[tokio::test]
async fn webhook_without_signature_is_unauthorized() {
    let app = TestApp::new().await;
    let payload = charge_success_payload("CHIMES-TEST-1700000000000-1");

    let response = deliver(&app, &payload, None).await;

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn webhook_with_wrong_key_signature_changes_nothing() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = charge_success_payload(&reference);
    let forged = sign_with("sk_test_attacker_key", &payload);

    let response = deliver(&app, &payload, Some(&forged)).await;

    assert_eq!(response.status(), 401);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending");
    assert_eq!(stock_of(&app, chime.id).await, 5);
}

#[tokio::test]
async fn webhook_rejects_payload_tampered_after_signing() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = charge_success_payload(&reference);
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);
    let tampered = payload.replace("charge.success", "charge.false??");

    let response = deliver(&app, &tampered, Some(&signature)).await;

    assert_eq!(response.status(), 401);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending");
}

// ==================== Settlement Tests ====================

#[tokio::test]
async fn webhook_settles_payment_and_decrements_stock() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = charge_success_payload(&reference);
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    assert_eq!(response.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "success");
    assert_eq!(record.delivery_status.to_string(), "paid");
    assert_eq!(stock_of(&app, chime.id).await, 3);

    // Cart is consumed by the settlement
    let cart = app.request(Method::GET, "/api/v1/cart", None, Some(&token)).await;
    let bytes = axum::body::to_bytes(cart.into_body(), usize::MAX)
        .await
        .expect("cart body bytes");
    let cart_body: serde_json::Value = serde_json::from_slice(&bytes).expect("cart json");
    assert!(cart_body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_for_unknown_reference_is_acknowledged() {
    let app = TestApp::new().await;

    let payload = charge_success_payload("CHIMES-TEST-1699999999999-7");
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    // 200 so the gateway stops redelivering an event we can never match
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn signed_but_malformed_body_is_acknowledged() {
    let app = TestApp::new().await;

    let payload = "not json at all";
    let signature = sign_with(TEST_PAYSTACK_SECRET, payload);

    let response = deliver(&app, payload, Some(&signature)).await;

    // The sender is authenticated; redelivering the same body would only
    // fail the same way, so it gets a 200
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn charge_success_without_reference_is_acknowledged() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = json!({ "event": "charge.success", "data": {} }).to_string();
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    assert_eq!(response.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending");
    assert_eq!(stock_of(&app, chime.id).await, 5);
}

#[tokio::test]
async fn webhook_ignores_events_other_than_charge_success() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = json!({
        "event": "charge.dispute.create",
        "data": { "reference": reference }
    })
    .to_string();
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    assert_eq!(response.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending");
    assert_eq!(stock_of(&app, chime.id).await, 5);
}

#[tokio::test]
async fn webhook_replay_settles_once() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 5).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let payload = charge_success_payload(&reference);
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    for _ in 0..2 {
        let response = deliver(&app, &payload, Some(&signature)).await;
        assert_eq!(response.status(), 200);
    }

    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "success");
    assert_eq!(
        stock_of(&app, chime.id).await,
        3,
        "replay must not decrement stock a second time"
    );
}

// ==================== Refund Path Tests ====================

#[tokio::test]
async fn webhook_parks_payment_for_refund_when_stock_ran_out() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 2).await;
    let (token, reference) = pending_checkout(&app, &chime, 2).await;

    // One unit sold elsewhere between checkout and the charge landing
    let mut active: product::ActiveModel = Product::find_by_id(chime.id)
        .one(app.state.db.as_ref())
        .await
        .expect("query product")
        .expect("product exists")
        .into();
    active.stock = Set(1);
    active
        .update(app.state.db.as_ref())
        .await
        .expect("shrink stock");

    Mock::given(method("POST"))
        .and(path("/refund"))
        .and(body_partial_json(json!({
            "transaction": reference,
            "merchant_note": "insufficient stock: Wind Chime (requested 2, available 1)"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Refund has been queued for processing",
            "data": { "id": 4242 }
        })))
        .expect(1)
        .mount(&app.paystack)
        .await;

    let payload = charge_success_payload(&reference);
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    assert_eq!(response.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending-refund");
    assert_eq!(record.delivery_status.to_string(), "cancelled");
    assert_eq!(stock_of(&app, chime.id).await, 1, "no partial decrement");

    // The purchase attempt is over either way; the cart goes with it
    let cart = app.request(Method::GET, "/api/v1/cart", None, Some(&token)).await;
    let bytes = axum::body::to_bytes(cart.into_body(), usize::MAX)
        .await
        .expect("cart body bytes");
    let cart_body: serde_json::Value = serde_json::from_slice(&bytes).expect("cart json");
    assert!(cart_body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_refund_request_failure_does_not_unsettle_the_record() {
    let app = TestApp::new().await;
    let chime = app.seed_product("Wind Chime", dec!(19.99), 2).await;
    let (_token, reference) = pending_checkout(&app, &chime, 2).await;

    let mut active: product::ActiveModel = Product::find_by_id(chime.id)
        .one(app.state.db.as_ref())
        .await
        .expect("query product")
        .expect("product exists")
        .into();
    active.stock = Set(0);
    active
        .update(app.state.db.as_ref())
        .await
        .expect("drain stock");

    Mock::given(method("POST"))
        .and(path("/refund"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&app.paystack)
        .await;

    let payload = charge_success_payload(&reference);
    let signature = sign_with(TEST_PAYSTACK_SECRET, &payload);

    let response = deliver(&app, &payload, Some(&signature)).await;

    // Refund failures are an operator problem, not the gateway's
    assert_eq!(response.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending-refund");

    // Replay after the state flip stays a no-op
    let replay = deliver(&app, &payload, Some(&signature)).await;
    assert_eq!(replay.status(), 200);
    let record = payment_by_reference(&app, &reference).await;
    assert_eq!(record.payment_status.to_string(), "pending-refund");
}
