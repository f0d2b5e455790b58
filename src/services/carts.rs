use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, Set, SqlErr, TransactionTrait,
};
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::cart::{self, OrderStatus, PaymentMethod};
use crate::entities::{cart_item, product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Fields recorded alongside a status transition. Everything defaults to
/// "leave as is"; callers set only what the transition defines.
#[derive(Debug, Default)]
pub struct StatusChange {
    pub payment_method: Option<PaymentMethod>,
    pub order_reference: Option<String>,
    pub payment_reference: Option<String>,
    pub modification_reference: Option<String>,
}

/// Owns the cart table: find/create of the single open cart per owner, line
/// mutations with totals recomputation, the secondary payment-reference
/// lookups, and validated status transitions.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    /// Per-owner mutex closing the find-or-create race; the partial unique
    /// index on open carts backstops anything that slips past it.
    creation_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db,
            event_sender,
            creation_locks: Arc::new(DashMap::new()),
        }
    }

    /// Returns the owner's single open cart, if any.
    #[instrument(skip(self))]
    pub async fn find_open_cart(&self, owner: Uuid) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::CustomerId.eq(owner))
            .filter(cart::Column::Status.eq(OrderStatus::Open))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Eager fetch of the open cart together with its lines. The lines are
    /// always loaded here; nothing downstream relies on lazy loading.
    #[instrument(skip(self))]
    pub async fn open_cart_with_items(
        &self,
        owner: Uuid,
    ) -> Result<(cart::Model, Vec<cart_item::Model>), ServiceError> {
        let cart = self
            .find_open_cart(owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No open cart for owner {}", owner)))?;
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&*self.db)
            .await?;
        Ok((cart, items))
    }

    /// The owner's active cart regardless of where it is in the lifecycle:
    /// open, or parked awaiting a payment outcome. At most one exists.
    #[instrument(skip(self))]
    pub async fn find_active_cart(&self, owner: Uuid) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::CustomerId.eq(owner))
            .filter(cart::Column::Status.is_in([
                OrderStatus::Open,
                OrderStatus::PendingPayment,
                OrderStatus::Pending,
            ]))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// The owner's cart awaiting a payment outcome (authorisation issued but
    /// not yet settled), used by the redirect completion flow.
    #[instrument(skip(self))]
    pub async fn find_awaiting_payment(
        &self,
        owner: Uuid,
    ) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::CustomerId.eq(owner))
            .filter(
                cart::Column::Status
                    .is_in([OrderStatus::PendingPayment, OrderStatus::Pending]),
            )
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    pub async fn find_by_id(&self, cart_id: Uuid) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find_by_id(cart_id).one(&*self.db).await?;
        Ok(found)
    }

    /// Webhook lookup key: the merchant reference minted at checkout, carried
    /// back by authorisation notifications.
    pub async fn find_by_order_reference(
        &self,
        reference: &str,
    ) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::OrderReference.eq(reference))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Webhook lookup key: the PSP reference captured at authorisation time.
    pub async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::PaymentReference.eq(reference))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Webhook lookup key: the PSP reference captured when a refund/cancel was
    /// requested.
    pub async fn find_by_modification_reference(
        &self,
        reference: &str,
    ) -> Result<Option<cart::Model>, ServiceError> {
        let found = cart::Entity::find()
            .filter(cart::Column::PaymentModificationReference.eq(reference))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Returns the owner's open cart, creating one when absent. Concurrent
    /// calls for the same owner serialize on a per-owner mutex; an insert that
    /// still hits the unique index retries as a find.
    #[instrument(skip(self))]
    pub async fn find_or_create_open_cart(
        &self,
        owner: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let lock = self
            .creation_locks
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.find_open_cart(owner).await? {
            return Ok(existing);
        }

        match self.insert_open_cart(owner).await {
            Ok(created) => {
                info!(cart_id = %created.id, %owner, "Created open cart");
                self.event_sender
                    .send_or_log(Event::CartCreated(created.id))
                    .await;
                Ok(created)
            }
            Err(ServiceError::Conflict(_)) => {
                self.find_open_cart(owner).await?.ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "Open cart for owner {} vanished after unique-constraint retry",
                        owner
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_open_cart(&self, owner: Uuid) -> Result<cart::Model, ServiceError> {
        let now = Utc::now();
        let new_cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(owner),
            status: Set(OrderStatus::Open),
            total_price: Set(Decimal::ZERO),
            payment_method: Set(None),
            order_reference: Set(None),
            payment_reference: Set(None),
            payment_modification_reference: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        new_cart.insert(&*self.db).await.map_err(|e| {
            if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                ServiceError::Conflict(format!("Owner {} already has an open cart", owner))
            } else {
                ServiceError::DatabaseError(e)
            }
        })
    }

    /// Adds one unit of a product to the owner's open cart, merging into an
    /// existing line when the product is already present. The line snapshots
    /// the catalog price in effect now; the cart total is recomputed from all
    /// lines inside the same transaction.
    #[instrument(skip(self))]
    pub async fn add_product(
        &self,
        owner: Uuid,
        product_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let cart = self.find_or_create_open_cart(owner).await?;

        let txn = self.db.begin().await?;

        let product = product::Entity::find_by_id(product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        // Re-read inside the transaction: the cart may have left `Open`
        // between the lookup above and here.
        let cart = cart::Entity::find_by_id(cart.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart.id)))?;
        if cart.status != OrderStatus::Open {
            return Err(ServiceError::Conflict(format!(
                "Cart {} is no longer open",
                cart.id
            )));
        }

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let new_quantity = item.quantity + 1;
                let mut line = item.into_active_model();
                line.quantity = Set(new_quantity);
                line.unit_price = Set(product.price);
                line.line_total = Set(product.price * Decimal::from(new_quantity));
                line.updated_at = Set(Utc::now());
                line.update(&txn).await?;
            }
            None => {
                let now = Utc::now();
                let line = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    quantity: Set(1),
                    unit_price: Set(product.price),
                    line_total: Set(product.price),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                line.insert(&txn).await.map_err(|e| {
                    // The (cart_id, product_id) unique index caught a
                    // concurrent add of the same product.
                    if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                        ServiceError::Conflict(format!(
                            "Product {} was added concurrently; retry",
                            product_id
                        ))
                    } else {
                        ServiceError::DatabaseError(e)
                    }
                })?;
            }
        }

        let cart_id = cart.id;
        let updated = self.recalculate_totals(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                product_id,
            })
            .await;

        Ok(updated)
    }

    /// Removes a line from the owner's open cart and recomputes the total.
    #[instrument(skip(self))]
    pub async fn remove_line(
        &self,
        owner: Uuid,
        line_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = cart::Entity::find()
            .filter(cart::Column::CustomerId.eq(owner))
            .filter(cart::Column::Status.eq(OrderStatus::Open))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No open cart for owner {}", owner)))?;

        let item = cart_item::Entity::find_by_id(line_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Line {} not found in cart {}", line_id, cart.id))
            })?;

        cart_item::Entity::delete_by_id(item.id).exec(&txn).await?;

        let cart_id = cart.id;
        let updated = self.recalculate_totals(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id,
                item_id: line_id,
            })
            .await;

        Ok(updated)
    }

    /// Applies a lifecycle transition, rejecting anything the transition table
    /// disallows. This is the single write path for `status` once a cart
    /// exists; checkout, redirect completion and the webhook processor all go
    /// through it. The read-check-write runs in one transaction.
    #[instrument(skip(self, change))]
    pub async fn transition(
        &self,
        cart_id: Uuid,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<cart::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = cart::Entity::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if !cart.status.can_transition_to(&next) {
            return Err(ServiceError::InvalidTransition(format!(
                "{:?} -> {:?} is not allowed for cart {}",
                cart.status, next, cart_id
            )));
        }

        let old_status = cart.status;
        let mut active = cart.into_active_model();
        active.status = Set(next);
        if let Some(method) = change.payment_method {
            active.payment_method = Set(Some(method));
        }
        if let Some(reference) = change.order_reference {
            active.order_reference = Set(Some(reference));
        }
        if let Some(reference) = change.payment_reference {
            active.payment_reference = Set(Some(reference));
        }
        if let Some(reference) = change.modification_reference {
            active.payment_modification_reference = Set(Some(reference));
        }
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(%cart_id, ?old_status, ?next, "Cart status changed");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                cart_id,
                old_status: format!("{:?}", old_status),
                new_status: format!("{:?}", next),
            })
            .await;

        Ok(updated)
    }

    async fn recalculate_totals(
        &self,
        txn: &DatabaseTransaction,
        cart: cart::Model,
    ) -> Result<cart::Model, ServiceError> {
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(txn)
            .await?;
        let total: Decimal = items.iter().map(|item| item.line_total).sum();

        let mut active = cart.into_active_model();
        active.total_price = Set(total);
        active.updated_at = Set(Utc::now());
        let updated = active.update(txn).await?;
        Ok(updated)
    }
}
