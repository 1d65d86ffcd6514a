use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func},
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{payment_item, product, Product, ProductModel},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Catalog management.
///
/// Products carry the live stock counter that checkout decrements, so
/// deletion is refused while payment history still points at a product.
#[derive(Clone)]
pub struct ProductService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl ProductService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Create a new product.
    ///
    /// Product names are unique; a duplicate name is rejected with a
    /// conflict before touching the unique index so the caller gets a
    /// readable message instead of a raw constraint violation.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: NewProduct) -> Result<ProductModel, ServiceError> {
        validate_price_and_stock(Some(input.price), Some(input.stock))?;

        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::ValidationError(
                "product name must not be empty".to_string(),
            ));
        }

        let existing = Product::find()
            .filter(product::Column::Name.eq(name.as_str()))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "product with name '{}' already exists",
                name
            )));
        }

        let now = chrono::Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            description: Set(input.description.filter(|d| !d.trim().is_empty())),
            price: Set(input.price),
            stock: Set(input.stock),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&*self.db).await?;

        info!(product_id = %created.id, name = %created.name, "Created product");
        self.event_sender
            .send_or_log(Event::ProductCreated(created.id))
            .await;

        Ok(created)
    }

    /// Fetch a single product by id.
    #[instrument(skip(self))]
    pub async fn get_product(&self, id: Uuid) -> Result<ProductModel, ServiceError> {
        Product::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    /// List products, optionally filtered by a case-insensitive search term
    /// over name and description.
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        search: Option<String>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<ProductModel>, u64), ServiceError> {
        let mut query = Product::find();

        if let Some(term) = search {
            let term = term.trim().to_lowercase();
            if !term.is_empty() {
                let pattern = format!("%{}%", term);
                query = query.filter(
                    Condition::any()
                        .add(
                            Expr::expr(Func::lower(Expr::col(product::Column::Name)))
                                .like(pattern.clone()),
                        )
                        .add(
                            Expr::expr(Func::lower(Expr::col(product::Column::Description)))
                                .like(pattern),
                        ),
                );
            }
        }

        let paginator = query
            .order_by_asc(product::Column::Name)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let page_index = page.max(1) - 1;
        let products = paginator.fetch_page(page_index).await?;

        Ok((products, total))
    }

    /// Apply a partial update to a product. Absent fields are untouched.
    #[instrument(skip(self, patch))]
    pub async fn update_product(
        &self,
        id: Uuid,
        patch: ProductPatch,
    ) -> Result<ProductModel, ServiceError> {
        validate_price_and_stock(patch.price, patch.stock)?;

        let existing = Product::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        if let Some(name) = &patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ServiceError::ValidationError(
                    "product name must not be empty".to_string(),
                ));
            }
            if name != existing.name {
                let taken = Product::find()
                    .filter(product::Column::Name.eq(name))
                    .filter(product::Column::Id.ne(id))
                    .one(&*self.db)
                    .await?;
                if taken.is_some() {
                    return Err(ServiceError::Conflict(format!(
                        "product with name '{}' already exists",
                        name
                    )));
                }
            }
        }

        let mut model: product::ActiveModel = existing.into();
        if let Some(name) = patch.name {
            model.name = Set(name.trim().to_string());
        }
        if let Some(description) = patch.description {
            model.description = Set(Some(description).filter(|d| !d.trim().is_empty()));
        }
        if let Some(price) = patch.price {
            model.price = Set(price);
        }
        if let Some(stock) = patch.stock {
            model.stock = Set(stock);
        }
        model.updated_at = Set(chrono::Utc::now());

        let updated = model.update(&*self.db).await?;

        info!(product_id = %updated.id, "Updated product");
        self.event_sender
            .send_or_log(Event::ProductUpdated(updated.id))
            .await;

        Ok(updated)
    }

    /// Delete a product.
    ///
    /// Payment item snapshots reference products with a restrict foreign
    /// key, so a product that has ever been paid for cannot be removed.
    #[instrument(skip(self))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let existing = Product::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let referenced = payment_item::Entity::find()
            .filter(payment_item::Column::ProductId.eq(id))
            .count(&*self.db)
            .await?;
        if referenced > 0 {
            return Err(ServiceError::Conflict(
                "product has payment history and cannot be deleted".to_string(),
            ));
        }

        product::ActiveModel::from(existing).delete(&*self.db).await?;

        info!(product_id = %id, "Deleted product");
        self.event_sender
            .send_or_log(Event::ProductDeleted(id))
            .await;

        Ok(())
    }
}

fn validate_price_and_stock(
    price: Option<Decimal>,
    stock: Option<i32>,
) -> Result<(), ServiceError> {
    if let Some(price) = price {
        if price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "price must be greater than zero".to_string(),
            ));
        }
    }
    if let Some(stock) = stock {
        if stock < 0 {
            return Err(ServiceError::ValidationError(
                "stock must not be negative".to_string(),
            ));
        }
    }
    Ok(())
}

/// Input for creating a product
#[derive(Debug, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub stock: i32,
}

/// Partial update for a product
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub stock: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    #[test]
    fn price_must_be_positive() {
        assert!(validate_price_and_stock(Some(dec!(0.01)), None).is_ok());
        assert_matches!(
            validate_price_and_stock(Some(Decimal::ZERO), None),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            validate_price_and_stock(Some(dec!(-3.50)), None),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn stock_must_be_non_negative() {
        assert!(validate_price_and_stock(None, Some(0)).is_ok());
        assert_matches!(
            validate_price_and_stock(None, Some(-1)),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn empty_patch_validates() {
        let patch = ProductPatch::default();
        assert!(validate_price_and_stock(patch.price, patch.stock).is_ok());
    }
}
