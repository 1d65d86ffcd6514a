use std::collections::HashSet;
use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set,
    SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{cart, cart_item, product, Cart, CartItem, CartItemModel, CartModel, ProductModel},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Shopping cart operations.
///
/// Each user has at most one live cart, created lazily on first write.
/// Stock is not checked here; carts only express intent and checkout is
/// where availability gets enforced.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Add a quantity of a product to the user's cart.
    ///
    /// If the cart already holds a line for this product the quantities are
    /// merged rather than duplicating the line.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartWithItems, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }

        let product = product::Entity::find_by_id(input.product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let cart = self.ensure_cart(user_id).await?;

        let txn = self.db.begin().await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product.id))
            .one(&txn)
            .await?;

        match existing {
            Some(line) => {
                let merged = line.quantity + input.quantity;
                let mut line: cart_item::ActiveModel = line.into();
                line.quantity = Set(merged);
                line.updated_at = Set(chrono::Utc::now());
                line.update(&txn).await?;
            }
            None => {
                let now = chrono::Utc::now();
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    quantity: Set(input.quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;

        info!(
            cart_id = %cart.id,
            product_id = %product.id,
            quantity = input.quantity,
            "Added item to cart"
        );
        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id: product.id,
                quantity: input.quantity,
            })
            .await;

        self.load_cart_view(Some(cart)).await
    }

    /// Fetch the user's cart with product details per line.
    ///
    /// A user who has never written to their cart gets an empty view, not
    /// an error.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?;
        self.load_cart_view(cart).await
    }

    /// Replace the entire cart contents with the given lines.
    ///
    /// The payload must not name the same product twice and every product
    /// must exist. An empty payload leaves an empty cart.
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub async fn replace_items(
        &self,
        user_id: Uuid,
        lines: Vec<CartLineInput>,
    ) -> Result<CartWithItems, ServiceError> {
        let mut seen = HashSet::new();
        for line in &lines {
            if line.quantity < 1 {
                return Err(ServiceError::ValidationError(
                    "quantity must be at least 1".to_string(),
                ));
            }
            if !seen.insert(line.product_id) {
                return Err(ServiceError::ValidationError(format!(
                    "product {} appears more than once",
                    line.product_id
                )));
            }
        }

        for line in &lines {
            let exists = product::Entity::find_by_id(line.product_id)
                .one(&*self.db)
                .await?
                .is_some();
            if !exists {
                return Err(ServiceError::NotFound(format!(
                    "Product {} not found",
                    line.product_id
                )));
            }
        }

        let cart = self.ensure_cart(user_id).await?;

        let txn = self.db.begin().await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        let now = chrono::Utc::now();
        for line in &lines {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(line.product_id),
                quantity: Set(line.quantity),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(cart_id = %cart.id, lines = lines.len(), "Replaced cart contents");
        self.event_sender
            .send_or_log(Event::CartReplaced(cart.id))
            .await;

        self.load_cart_view(Some(cart)).await
    }

    /// Remove every line from the user's cart. The cart row itself stays so
    /// repeated clears and clears of never-used carts are both no-ops.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?;

        let Some(cart) = cart else {
            return Ok(());
        };

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&*self.db)
            .await?;

        info!(cart_id = %cart.id, "Cleared cart");
        self.event_sender
            .send_or_log(Event::CartCleared(cart.id))
            .await;

        Ok(())
    }

    /// Find the user's cart or create it.
    ///
    /// The unique index on carts.user_id decides races between concurrent
    /// first writes; the loser picks up the winner's row.
    async fn ensure_cart(&self, user_id: Uuid) -> Result<CartModel, ServiceError> {
        if let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        {
            return Ok(cart);
        }

        let now = chrono::Utc::now();
        let fresh = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match fresh.insert(&*self.db).await {
            Ok(cart) => Ok(cart),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Cart::find()
                    .filter(cart::Column::UserId.eq(user_id))
                    .one(&*self.db)
                    .await?
                    .ok_or(ServiceError::DatabaseError(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_cart_view(
        &self,
        cart: Option<CartModel>,
    ) -> Result<CartWithItems, ServiceError> {
        let Some(cart) = cart else {
            return Ok(CartWithItems {
                cart: None,
                items: Vec::new(),
            });
        };

        let rows = cart
            .find_related(CartItem)
            .find_also_related(product::Entity)
            .all(&*self.db)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for (item, product) in rows {
            let product = product.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "cart line {} references a missing product",
                    item.id
                ))
            })?;
            items.push(CartLine { item, product });
        }

        Ok(CartWithItems {
            cart: Some(cart),
            items,
        })
    }
}

/// Input for adding an item to the cart
#[derive(Debug, Deserialize)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// One line of a wholesale cart replacement
#[derive(Debug, Deserialize)]
pub struct CartLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// A cart line joined with its product
#[derive(Debug, Serialize)]
pub struct CartLine {
    pub item: CartItemModel,
    pub product: ProductModel,
}

/// Cart with product details, `cart: None` when the user has no cart yet
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: Option<CartModel>,
    pub items: Vec<CartLine>,
}

impl CartWithItems {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_view_reports_empty() {
        let view = CartWithItems {
            cart: None,
            items: Vec::new(),
        };
        assert!(view.is_empty());
    }

    #[test]
    fn add_to_cart_input_deserializes() {
        let input: AddToCartInput = serde_json::from_str(
            r#"{"product_id":"7f8a6a70-1f40-4c5e-9d8e-0d58a7a0b111","quantity":2}"#,
        )
        .unwrap();
        assert_eq!(input.quantity, 2);
    }
}
