use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ephemeral record created when the PSP asks for a redirect step. It carries
/// everything needed to finish the payment when the shopper comes back:
/// the PSP continuation blob, the method the flow started with, the owner, and
/// where to send the browser afterwards. Keyed by the store-generated
/// `order_ref` that rides along in the redirect URL, consumed exactly once.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_correlations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_ref: String,
    #[sea_orm(column_type = "Text")]
    pub continuation_data: String,
    pub payment_method_type: String,
    pub originating_referrer: String,
    pub customer_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
