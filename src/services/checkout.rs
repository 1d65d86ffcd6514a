use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, ModelTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        cart, cart_item, payment, payment_item, product, Cart, CartItem, DeliveryStatus, Payment,
        PaymentItem, PaymentModel, PaymentStatus,
    },
    errors::{ServiceError, StockShortage},
    events::{Event, EventSender},
    services::paystack::PaymentGateway,
};

/// References are interpolated into gateway URL paths, so anything outside
/// this charset is rejected before it reaches the wire.
static REFERENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid reference pattern"));

/// Checkout and payment reconciliation.
///
/// A checkout produces a pending payment record tied to a gateway
/// transaction by reference. Reconciliation later flips that record to a
/// terminal status, either through a client-driven verify call or through
/// the gateway's webhook. Both paths share one primitive,
/// [`CheckoutService::try_reconcile_success`], whose conditional stock
/// decrement doubles as the authoritative availability check.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    reference_prefix: String,
}

/// Outcome of a settlement attempt.
enum Settlement {
    /// This call won the status claim and applied the stock effects.
    Applied(PaymentModel),
    /// Another reconciliation settled the record first; carries its
    /// committed state.
    AlreadySettled(PaymentModel),
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        reference_prefix: impl Into<String>,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            reference_prefix: reference_prefix.into(),
        }
    }

    /// Start a checkout for the user's cart.
    ///
    /// Validates the whole cart up front: an empty cart is rejected, and
    /// stock is checked across every line so the caller learns about all
    /// shortages at once instead of fixing them one at a time. Only after
    /// the gateway accepts the transaction does a pending payment record
    /// plus its item snapshots get written, in one transaction. A gateway
    /// transaction without a local record can be left behind if that write
    /// fails; the inverse, a local record without a gateway transaction,
    /// cannot.
    #[instrument(skip(self, email))]
    pub async fn initialize_checkout(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> Result<InitializedCheckout, ServiceError> {
        let lines = self.load_cart_lines(user_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError("cart is empty".to_string()));
        }

        let shortages: Vec<StockShortage> = lines
            .iter()
            .filter(|(item, product)| product.stock < item.quantity)
            .map(|(item, product)| StockShortage {
                product_id: product.id,
                name: product.name.clone(),
                requested: item.quantity,
                available: product.stock,
            })
            .collect();
        if !shortages.is_empty() {
            return Err(ServiceError::InsufficientStock(shortages));
        }

        let total: Decimal = lines
            .iter()
            .map(|(item, product)| product.price * Decimal::from(item.quantity))
            .sum();

        let reference = generate_reference(&self.reference_prefix);

        let gateway_txn = self
            .gateway
            .initialize_transaction(email, total, &reference)
            .await?;

        let now = chrono::Utc::now();
        let payment_id = Uuid::new_v4();

        let txn = self.db.begin().await?;

        let insert = payment::ActiveModel {
            id: Set(payment_id),
            user_id: Set(user_id),
            reference: Set(reference.clone()),
            email: Set(email.to_string()),
            total_amount: Set(total),
            payment_status: Set(PaymentStatus::Pending),
            delivery_status: Set(DeliveryStatus::Pending),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await;

        let record = match insert {
            Ok(record) => record,
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                warn!(reference = %reference, "Payment reference collided");
                return Err(ServiceError::Conflict(
                    "payment reference already in use, retry checkout".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        for (item, product) in &lines {
            payment_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                payment_id: Set(payment_id),
                product_id: Set(product.id),
                quantity: Set(item.quantity),
                price_at_purchase: Set(product.price),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(
            payment_id = %record.id,
            reference = %record.reference,
            total = %record.total_amount,
            "Initialized checkout"
        );
        self.event_sender
            .send_or_log(Event::CheckoutInitialized {
                payment_id: record.id,
                reference: record.reference.clone(),
                total_amount: record.total_amount,
            })
            .await;

        Ok(InitializedCheckout {
            authorization_url: gateway_txn.authorization_url,
            access_code: gateway_txn.access_code,
            reference: record.reference,
        })
    }

    /// Confirm a payment against the gateway and settle it locally.
    ///
    /// Safe to call any number of times: once the record is terminal the
    /// current state is returned without consulting the gateway again. A
    /// gateway answer other than success leaves the record pending.
    #[instrument(skip(self))]
    pub async fn verify_payment(&self, reference: &str) -> Result<PaymentModel, ServiceError> {
        if !REFERENCE_PATTERN.is_match(reference) {
            return Err(ServiceError::BadRequest(
                "malformed payment reference".to_string(),
            ));
        }

        let record = Payment::find()
            .filter(payment::Column::Reference.eq(reference))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment with reference {}", reference))
            })?;

        if record.payment_status.is_terminal() {
            info!(
                reference = %reference,
                status = %record.payment_status,
                "Verify called on settled payment, returning current state"
            );
            return Ok(record);
        }

        let verified = self.gateway.verify_transaction(reference).await?;
        if !verified.is_successful() {
            info!(
                reference = %reference,
                gateway_status = %verified.status,
                "Gateway does not report success, payment stays pending"
            );
            return Err(ServiceError::ValidationError(
                "payment not successful".to_string(),
            ));
        }

        let settled = match self.try_reconcile_success(record).await? {
            Settlement::Applied(settled) => {
                self.event_sender
                    .send_or_log(Event::PaymentSucceeded {
                        payment_id: settled.id,
                        reference: settled.reference.clone(),
                    })
                    .await;
                settled
            }
            // A concurrent settlement already applied the side effects;
            // the committed state is the answer either way.
            Settlement::AlreadySettled(settled) => settled,
        };

        Ok(settled)
    }

    /// Settle a charge the gateway has confirmed via webhook.
    ///
    /// The caller has already checked the webhook signature and filtered
    /// the event type. Unknown references and already-settled records are
    /// acknowledged without doing anything, so gateway replays are
    /// harmless. When stock ran out between checkout and the charge, the
    /// record is parked as pending-refund and a refund is requested after
    /// the commit; a refund request failure is logged and not retried.
    /// Database errors propagate so the gateway keeps redelivering.
    #[instrument(skip(self))]
    pub async fn reconcile_successful_charge(&self, reference: &str) -> Result<(), ServiceError> {
        let record = Payment::find()
            .filter(payment::Column::Reference.eq(reference))
            .one(&*self.db)
            .await?;

        let Some(record) = record else {
            info!(reference = %reference, "Webhook for unknown reference, ignoring");
            return Ok(());
        };

        match self.try_reconcile_success(record).await {
            Ok(Settlement::Applied(settled)) => {
                self.event_sender
                    .send_or_log(Event::PaymentSucceeded {
                        payment_id: settled.id,
                        reference: settled.reference.clone(),
                    })
                    .await;
                Ok(())
            }
            Ok(Settlement::AlreadySettled(settled)) => {
                info!(
                    reference = %reference,
                    status = %settled.payment_status,
                    "Webhook replay for settled payment, ignoring"
                );
                Ok(())
            }
            Err(ServiceError::InsufficientStock(shortages)) => {
                let record = Payment::find()
                    .filter(payment::Column::Reference.eq(reference))
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "payment {} disappeared during reconciliation",
                            reference
                        ))
                    })?;
                self.park_for_refund(record, &shortages).await
            }
            Err(err) => Err(err),
        }
    }

    /// Flip a pending payment to success and apply its stock effects.
    ///
    /// Runs entirely in one transaction, which opens by claiming the
    /// status transition with an update restricted to pending rows. Only
    /// one of two racing settlements can win that claim; the loser learns
    /// the record is already settled and touches no stock. Each item
    /// snapshot is then applied as a conditional decrement that only
    /// matches rows with enough stock. Every failed decrement is collected
    /// before giving up, which reports the full shortage list rather than
    /// the first line that happened to run dry. On shortage the
    /// transaction rolls back, undoing the claim, and the record stays
    /// pending.
    async fn try_reconcile_success(
        &self,
        record: PaymentModel,
    ) -> Result<Settlement, ServiceError> {
        if !record.payment_status.can_transition_to(PaymentStatus::Success) {
            return Ok(Settlement::AlreadySettled(record));
        }

        let txn = self.db.begin().await?;

        let claim = Payment::update_many()
            .col_expr(
                payment::Column::PaymentStatus,
                Expr::value(PaymentStatus::Success),
            )
            .col_expr(
                payment::Column::DeliveryStatus,
                Expr::value(DeliveryStatus::Paid),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(payment::Column::Id.eq(record.id))
            .filter(payment::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await?;

        if claim.rows_affected == 0 {
            txn.rollback().await?;
            let current = Payment::find_by_id(record.id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "payment {} disappeared during reconciliation",
                        record.reference
                    ))
                })?;
            info!(
                reference = %current.reference,
                status = %current.payment_status,
                "Payment settled concurrently, skipping stock changes"
            );
            return Ok(Settlement::AlreadySettled(current));
        }

        let items = PaymentItem::find()
            .filter(payment_item::Column::PaymentId.eq(record.id))
            .all(&txn)
            .await?;

        let mut shortages = Vec::new();
        for item in &items {
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(item.quantity),
                )
                .filter(product::Column::Id.eq(item.product_id))
                .filter(product::Column::Stock.gte(item.quantity))
                .exec(&txn)
                .await?;

            if result.rows_affected == 0 {
                let current = product::Entity::find_by_id(item.product_id).one(&txn).await?;
                let (name, available) = current
                    .map(|p| (p.name, p.stock))
                    .unwrap_or_else(|| ("unknown product".to_string(), 0));
                shortages.push(StockShortage {
                    product_id: item.product_id,
                    name,
                    requested: item.quantity,
                    available,
                });
            }
        }

        if !shortages.is_empty() {
            txn.rollback().await?;
            warn!(
                payment_id = %record.id,
                reference = %record.reference,
                shortages = shortages.len(),
                "Stock ran out before settlement"
            );
            return Err(ServiceError::InsufficientStock(shortages));
        }

        delete_cart_of_user(&txn, record.user_id).await?;

        let settled = Payment::find_by_id(record.id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "payment {} disappeared during reconciliation",
                    record.reference
                ))
            })?;

        txn.commit().await?;

        info!(
            payment_id = %settled.id,
            reference = %settled.reference,
            "Payment settled and stock decremented"
        );
        Ok(Settlement::Applied(settled))
    }

    /// Park a paid-but-unfulfillable payment and ask the gateway to give
    /// the money back.
    ///
    /// The transition is claimed with the same pending-only update used
    /// for settlement, so a concurrent success cannot be overwritten. The
    /// status flip and cart removal commit first; the refund request
    /// happens after, outside any transaction, because the gateway call
    /// must not be able to roll back the state change. If the refund
    /// request fails the record still says pending-refund, which is the
    /// signal an operator works from.
    async fn park_for_refund(
        &self,
        record: PaymentModel,
        shortages: &[StockShortage],
    ) -> Result<(), ServiceError> {
        if !record
            .payment_status
            .can_transition_to(PaymentStatus::PendingRefund)
        {
            info!(
                reference = %record.reference,
                status = %record.payment_status,
                "Payment already terminal, nothing to park"
            );
            return Ok(());
        }

        let txn = self.db.begin().await?;

        let claim = Payment::update_many()
            .col_expr(
                payment::Column::PaymentStatus,
                Expr::value(PaymentStatus::PendingRefund),
            )
            .col_expr(
                payment::Column::DeliveryStatus,
                Expr::value(DeliveryStatus::Cancelled),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(payment::Column::Id.eq(record.id))
            .filter(payment::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await?;

        if claim.rows_affected == 0 {
            txn.rollback().await?;
            info!(
                reference = %record.reference,
                "Payment settled concurrently, not parking for refund"
            );
            return Ok(());
        }

        delete_cart_of_user(&txn, record.user_id).await?;

        txn.commit().await?;

        let reference = record.reference.clone();
        warn!(
            payment_id = %record.id,
            reference = %reference,
            "Charge received but stock ran out, payment parked for refund"
        );
        self.event_sender
            .send_or_log(Event::PaymentRefundPending {
                payment_id: record.id,
                reference: reference.clone(),
            })
            .await;

        let note = refund_note(shortages);
        if let Err(err) = self.gateway.request_refund(&reference, &note).await {
            error!(
                reference = %reference,
                error = %err,
                "Refund request failed, payment remains pending-refund"
            );
        }

        Ok(())
    }

    async fn load_cart_lines(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(cart_item::Model, product::Model)>, ServiceError> {
        let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        else {
            return Ok(Vec::new());
        };

        let rows = cart
            .find_related(CartItem)
            .find_also_related(product::Entity)
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for (item, product) in rows {
            let product = product.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "cart line {} references a missing product",
                    item.id
                ))
            })?;
            lines.push((item, product));
        }
        Ok(lines)
    }
}

/// Remove the user's cart and its lines. The purchase attempt is over
/// whether it settled or got parked for refund.
async fn delete_cart_of_user(
    txn: &DatabaseTransaction,
    user_id: Uuid,
) -> Result<(), ServiceError> {
    let Some(cart) = Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(txn)
        .await?
    else {
        return Ok(());
    };

    CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .exec(txn)
        .await?;
    cart.delete(txn).await?;

    Ok(())
}

fn generate_reference(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = rand::thread_rng().gen_range(0..1000);
    format!("{}-{}-{}", prefix, millis, seq)
}

fn refund_note(shortages: &[StockShortage]) -> String {
    let detail = shortages
        .iter()
        .map(|s| {
            format!(
                "{} (requested {}, available {})",
                s.name, s.requested, s.available
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!("insufficient stock: {}", detail)
}

/// What the client needs to hand control to the gateway's checkout page
#[derive(Debug, Serialize)]
pub struct InitializedCheckout {
    pub authorization_url: String,
    pub access_code: Option<String>,
    pub reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use crate::services::paystack::MockPaymentGateway;

    #[tokio::test]
    async fn hostile_references_are_rejected_before_any_io() {
        // A gateway mock with no expectations panics on any call, and the
        // disconnected database errors on any query; passing means the
        // reference guard fired before either was touched.
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let service = CheckoutService::new(
            Arc::new(DatabaseConnection::default()),
            Arc::new(MockPaymentGateway::new()),
            Arc::new(EventSender::new(tx)),
            "CHIMES-DEV",
        );

        let err = service.verify_payment("../secrets").await.unwrap_err();
        assert_matches!(err, ServiceError::BadRequest(_));
    }

    #[test]
    fn generated_references_carry_prefix_and_millis() {
        let reference = generate_reference("CHIMES-DEV");
        let shape = Regex::new(r"^CHIMES-DEV-\d{13}-\d{1,3}$").unwrap();
        assert!(
            shape.is_match(&reference),
            "unexpected reference {}",
            reference
        );
        assert!(REFERENCE_PATTERN.is_match(&reference));
    }

    #[test]
    fn reference_pattern_rejects_path_traversal() {
        assert!(!REFERENCE_PATTERN.is_match("../secrets"));
        assert!(!REFERENCE_PATTERN.is_match("ref/../../x"));
        assert!(!REFERENCE_PATTERN.is_match(""));
        assert!(!REFERENCE_PATTERN.is_match("ref with spaces"));
        assert!(REFERENCE_PATTERN.is_match("CHIMES-DEV-1700000000000-42"));
    }

    #[test]
    fn refund_note_names_every_short_line() {
        let shortages = vec![
            StockShortage {
                product_id: Uuid::new_v4(),
                name: "Wind Chime".to_string(),
                requested: 3,
                available: 1,
            },
            StockShortage {
                product_id: Uuid::new_v4(),
                name: "Brass Bell".to_string(),
                requested: 2,
                available: 0,
            },
        ];
        let note = refund_note(&shortages);
        assert_eq!(
            note,
            "insufficient stock: Wind Chime (requested 3, available 1); Brass Bell (requested 2, available 0)"
        );
    }

    proptest! {
        #[test]
        fn references_stay_in_safe_charset(prefix in "[A-Z]{2,12}(-[A-Z]{2,6})?") {
            let reference = generate_reference(&prefix);
            prop_assert!(REFERENCE_PATTERN.is_match(&reference));
        }
    }
}
