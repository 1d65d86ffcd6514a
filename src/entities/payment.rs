use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment record entity. Created `pending` at checkout initialization
/// and reconciled to a terminal status exactly once; rows are never
/// deleted. `reference` is the gateway transaction reference and is
/// unique. Item snapshots live in `payment_items`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub reference: String,
    pub email: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
    #[sea_orm(has_many = "super::payment_item::Entity")]
    PaymentItems,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::payment_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Payment status state machine:
///
/// ```text
/// pending -> success         (verify or webhook reconciliation)
/// pending -> pending-refund  (webhook shortage path)
/// pending -> failed          (reserved; no reconciliation path sets it)
/// ```
///
/// `success`, `failed` and `pending-refund` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    #[strum(serialize = "pending")]
    Pending,
    #[sea_orm(string_value = "success")]
    #[strum(serialize = "success")]
    Success,
    #[sea_orm(string_value = "failed")]
    #[strum(serialize = "failed")]
    Failed,
    #[sea_orm(string_value = "pending-refund")]
    #[strum(serialize = "pending-refund")]
    PendingRefund,
}

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Success)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Pending, PaymentStatus::PendingRefund)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Fulfilment status carried on the payment record. Only `pending`,
/// `paid` and `cancelled` are written by the reconciliation paths; the
/// rest exist for downstream fulfilment tooling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[sea_orm(string_value = "pending")]
    #[strum(serialize = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    #[strum(serialize = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    #[strum(serialize = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "shipped")]
    #[strum(serialize = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    #[strum(serialize = "delivered")]
    Delivered,
}
