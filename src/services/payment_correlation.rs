use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, SqlErr,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::payment_correlation;
use crate::errors::ServiceError;

/// Input for a new correlation entry, written when the PSP demands a redirect
/// step. `order_ref` is generated by the checkout flow before calling in.
#[derive(Debug)]
pub struct NewCorrelation {
    pub order_ref: String,
    pub continuation_data: String,
    pub payment_method_type: String,
    pub originating_referrer: String,
    pub customer_id: Uuid,
}

/// The ephemeral bridge between an outbound redirect and its returning
/// shopper. Entries live in the database so any instance can complete a
/// redirect; they are consumed exactly once and purged after `ttl` when the
/// shopper never returns.
#[derive(Clone)]
pub struct PaymentCorrelationService {
    db: Arc<DatabaseConnection>,
    ttl: chrono::Duration,
}

impl PaymentCorrelationService {
    pub fn new(db: Arc<DatabaseConnection>, ttl_secs: u64) -> Self {
        Self {
            db,
            ttl: chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    #[instrument(skip(self, entry), fields(order_ref = %entry.order_ref))]
    pub async fn create(
        &self,
        entry: NewCorrelation,
    ) -> Result<payment_correlation::Model, ServiceError> {
        let order_ref = entry.order_ref.clone();
        let model = payment_correlation::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_ref: Set(entry.order_ref),
            continuation_data: Set(entry.continuation_data),
            payment_method_type: Set(entry.payment_method_type),
            originating_referrer: Set(entry.originating_referrer),
            customer_id: Set(entry.customer_id),
            created_at: Set(Utc::now()),
        };

        model.insert(&*self.db).await.map_err(|e| {
            if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                ServiceError::Conflict(format!("Order reference {} already in flight", order_ref))
            } else {
                ServiceError::DatabaseError(e)
            }
        })
    }

    /// Looks up a live entry by order reference. An entry older than the TTL
    /// counts as absent and is removed on sight, so a stale redirect can never
    /// complete against it.
    #[instrument(skip(self))]
    pub async fn find_valid(
        &self,
        order_ref: &str,
    ) -> Result<Option<payment_correlation::Model>, ServiceError> {
        let entry = payment_correlation::Entity::find()
            .filter(payment_correlation::Column::OrderRef.eq(order_ref))
            .one(&*self.db)
            .await?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        if entry.created_at + self.ttl < Utc::now() {
            warn!(%order_ref, created_at = %entry.created_at, "Correlation entry expired; dropping");
            self.delete(order_ref).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Removes the entry for `order_ref`. Called exactly once per completed
    /// redirect round-trip; deleting an already-deleted reference is a no-op.
    #[instrument(skip(self))]
    pub async fn delete(&self, order_ref: &str) -> Result<(), ServiceError> {
        payment_correlation::Entity::delete_many()
            .filter(payment_correlation::Column::OrderRef.eq(order_ref))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Deletes every entry past the TTL. Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - self.ttl;
        let result = payment_correlation::Entity::delete_many()
            .filter(payment_correlation::Column::CreatedAt.lt(cutoff))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

/// Background cleanup of orphaned correlation entries (shoppers who never came
/// back from the PSP). Spawned once at startup.
pub async fn purge_loop(service: PaymentCorrelationService, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; skip it so startup stays quiet.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match service.purge_expired().await {
            Ok(0) => debug!("Correlation purge: nothing to remove"),
            Ok(removed) => info!(removed, "Purged expired correlation entries"),
            Err(e) => warn!("Correlation purge failed: {}", e),
        }
    }
}
