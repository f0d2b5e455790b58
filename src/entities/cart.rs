use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A shopper's cart, which doubles as the order record once payment starts.
/// `total_price` is derived from the line items and recomputed on every
/// mutation; it is never set independently.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "carts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_price: Decimal,
    pub payment_method: Option<PaymentMethod>,
    /// Our merchant reference for the payment attempt, minted at checkout.
    /// Authorisation webhooks carry it back as `merchantReference`.
    pub order_reference: Option<String>,
    /// The PSP's reference for the authorisation; needed to refund later.
    pub payment_reference: Option<String>,
    /// PSP reference of the cancel-or-refund call; webhook lookup key.
    pub payment_modification_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order lifecycle states. `Open` is the single mutable pre-payment state;
/// everything past it is immutable history driven by payment outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "open")]
    Open,
    /// Authorisation call issued (or about to be); a PSP timeout parks the
    /// cart here rather than reverting it to `Open`.
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    /// Asynchronous payment method accepted the attempt; outcome arrives by
    /// webhook.
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refund_initiated")]
    RefundInitiated,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "refund_failed")]
    RefundFailed,
}

impl OrderStatus {
    /// States counted against the one-active-cart-per-owner invariant.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Open | OrderStatus::PendingPayment | OrderStatus::Pending
        )
    }

    /// States from which a webhook authorisation outcome is still applicable.
    pub fn awaits_authorisation(&self) -> bool {
        matches!(self, OrderStatus::PendingPayment | OrderStatus::Pending)
    }

    /// The legal transition table. Anything not listed is illegal; there is no
    /// way out of `Cancelled`, `Refunded` or `RefundFailed`.
    pub fn can_transition_to(&self, next: &OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Open, PendingPayment)
                | (PendingPayment, Paid)
                | (PendingPayment, Cancelled)
                | (PendingPayment, Pending)
                | (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, RefundInitiated)
                | (RefundInitiated, Refunded)
                | (RefundInitiated, Cancelled)
                | (RefundInitiated, RefundFailed)
        )
    }
}

/// How the shopper pays. The stored value is ours; the PSP wire code is
/// exposed via [`PaymentMethod::psp_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "credit_card")]
    CreditCard,
    #[sea_orm(string_value = "ideal")]
    Ideal,
}

impl PaymentMethod {
    pub fn psp_type(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "scheme",
            PaymentMethod::Ideal => "ideal",
        }
    }

    pub fn from_psp_type(value: &str) -> Option<Self> {
        match value {
            "scheme" => Some(PaymentMethod::CreditCard),
            "ideal" => Some(PaymentMethod::Ideal),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_item::Entity")]
    CartItem,
}

impl Related<super::cart_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_immediate_outcomes_are_legal() {
        assert!(OrderStatus::Open.can_transition_to(&OrderStatus::PendingPayment));
        assert!(OrderStatus::PendingPayment.can_transition_to(&OrderStatus::Paid));
        assert!(OrderStatus::PendingPayment.can_transition_to(&OrderStatus::Cancelled));
        assert!(OrderStatus::PendingPayment.can_transition_to(&OrderStatus::Pending));
    }

    #[test]
    fn async_outcome_applies_from_both_waiting_states() {
        assert!(OrderStatus::Pending.can_transition_to(&OrderStatus::Paid));
        assert!(OrderStatus::Pending.can_transition_to(&OrderStatus::Cancelled));
        assert!(OrderStatus::PendingPayment.awaits_authorisation());
        assert!(OrderStatus::Pending.awaits_authorisation());
        assert!(!OrderStatus::Paid.awaits_authorisation());
    }

    #[test]
    fn refund_lifecycle() {
        assert!(OrderStatus::Paid.can_transition_to(&OrderStatus::RefundInitiated));
        assert!(OrderStatus::RefundInitiated.can_transition_to(&OrderStatus::Refunded));
        assert!(OrderStatus::RefundInitiated.can_transition_to(&OrderStatus::Cancelled));
        assert!(OrderStatus::RefundInitiated.can_transition_to(&OrderStatus::RefundFailed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use OrderStatus::*;
        for terminal in [Cancelled, Refunded, RefundFailed] {
            for next in [
                Open,
                PendingPayment,
                Pending,
                Paid,
                Cancelled,
                RefundInitiated,
                Refunded,
                RefundFailed,
            ] {
                assert!(
                    !terminal.can_transition_to(&next),
                    "{:?} must not transition to {:?}",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn skipping_pending_payment_is_illegal() {
        assert!(!OrderStatus::Open.can_transition_to(&OrderStatus::Paid));
        assert!(!OrderStatus::Open.can_transition_to(&OrderStatus::Cancelled));
        assert!(!OrderStatus::Paid.can_transition_to(&OrderStatus::Refunded));
    }

    #[test]
    fn active_states_match_invariant_set() {
        assert!(OrderStatus::Open.is_active());
        assert!(OrderStatus::PendingPayment.is_active());
        assert!(OrderStatus::Pending.is_active());
        assert!(!OrderStatus::Paid.is_active());
        assert!(!OrderStatus::Cancelled.is_active());
        assert!(!OrderStatus::Refunded.is_active());
    }

    #[test]
    fn payment_method_psp_codes_round_trip() {
        assert_eq!(PaymentMethod::CreditCard.psp_type(), "scheme");
        assert_eq!(PaymentMethod::Ideal.psp_type(), "ideal");
        assert_eq!(
            PaymentMethod::from_psp_type("scheme"),
            Some(PaymentMethod::CreditCard)
        );
        assert_eq!(PaymentMethod::from_psp_type("sofort"), None);
    }
}
