use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::entities::cart::OrderStatus;
use crate::errors::ServiceError;
use crate::services::carts::{CartService, StatusChange};

type HmacSha256 = Hmac<Sha256>;

/// Acknowledgement the PSP expects for every processed batch.
pub const NOTIFICATION_ACK: &str = "[accepted]";

const HMAC_SIGNATURE_KEY: &str = "hmacSignature";
const MODIFICATION_ACTION_KEY: &str = "modification.action";

/// One webhook batch as posted by the PSP.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(default)]
    pub live: Option<String>,
    #[serde(default)]
    pub notification_items: Vec<NotificationItem>,
}

/// Batch entry wrapper; the PSP nests each item under a keyed object.
#[derive(Debug, Deserialize)]
pub struct NotificationItem {
    #[serde(rename = "NotificationRequestItem")]
    pub notification_request_item: NotificationRequestItem,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequestItem {
    pub event_code: EventCode,
    #[serde(default)]
    pub psp_reference: String,
    #[serde(default)]
    pub original_reference: String,
    #[serde(default)]
    pub merchant_account_code: String,
    #[serde(default)]
    pub merchant_reference: String,
    #[serde(default)]
    pub amount: NotificationAmount,
    #[serde(deserialize_with = "deserialize_success")]
    pub success: bool,
    #[serde(default)]
    pub additional_data: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationAmount {
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EventCode {
    #[serde(rename = "AUTHORISATION")]
    Authorisation,
    #[serde(rename = "CANCEL_OR_REFUND")]
    CancelOrRefund,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(other)]
    Unknown,
}

/// The PSP serialises booleans as the strings "true"/"false" in some
/// notification channels and as JSON booleans in others.
fn deserialize_success<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
    }
    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b,
        BoolOrString::Text(s) => s.eq_ignore_ascii_case("true"),
    })
}

/// Applies PSP notifications to cart state. Processing is idempotent per
/// item: anything that cannot be matched or whose transition is no longer
/// legal is logged and skipped, and the batch is acknowledged regardless.
#[derive(Clone)]
pub struct WebhookProcessor {
    carts: CartService,
    hmac_key: Option<String>,
}

impl WebhookProcessor {
    pub fn new(carts: CartService, hmac_key: Option<String>) -> Self {
        Self { carts, hmac_key }
    }

    /// Processes every item of a batch and returns the fixed acknowledgement.
    #[instrument(skip(self, request), fields(items = request.notification_items.len()))]
    pub async fn process_batch(
        &self,
        request: NotificationRequest,
    ) -> Result<&'static str, ServiceError> {
        for item in request.notification_items {
            self.process_item(item.notification_request_item).await?;
        }
        Ok(NOTIFICATION_ACK)
    }

    async fn process_item(&self, item: NotificationRequestItem) -> Result<(), ServiceError> {
        match item.event_code {
            EventCode::Authorisation => self.apply_authorisation(item).await,
            EventCode::CancelOrRefund => self.apply_cancel_or_refund(item).await,
            EventCode::Pending => {
                info!(
                    psp_reference = %item.psp_reference,
                    merchant_reference = %item.merchant_reference,
                    "Payment pending at the PSP"
                );
                Ok(())
            }
            EventCode::Unknown => {
                warn!(
                    psp_reference = %item.psp_reference,
                    "Skipping notification with unhandled event code"
                );
                Ok(())
            }
        }
    }

    /// AUTHORISATION settles carts that were parked awaiting the PSP verdict.
    /// The item's `merchantReference` is our checkout token; the PSP's own
    /// reference is recorded on settle so the payment can be refunded later.
    /// Replays and out-of-order deliveries degrade to logged no-ops.
    async fn apply_authorisation(&self, item: NotificationRequestItem) -> Result<(), ServiceError> {
        let found = match self
            .carts
            .find_by_order_reference(&item.merchant_reference)
            .await?
        {
            Some(cart) => Some(cart),
            None => {
                self.carts
                    .find_by_payment_reference(&item.psp_reference)
                    .await?
            }
        };
        let cart = match found {
            Some(cart) => cart,
            None => {
                warn!(
                    psp_reference = %item.psp_reference,
                    merchant_reference = %item.merchant_reference,
                    "AUTHORISATION for unknown payment"
                );
                return Ok(());
            }
        };

        if !cart.status.awaits_authorisation() {
            info!(
                cart_id = %cart.id,
                status = ?cart.status,
                "AUTHORISATION replay ignored"
            );
            return Ok(());
        }

        let next = if item.success {
            OrderStatus::Paid
        } else {
            OrderStatus::Cancelled
        };
        let change = StatusChange {
            payment_reference: Some(item.psp_reference.clone()),
            ..Default::default()
        };
        self.settle(cart.id, next, change).await
    }

    /// CANCEL_OR_REFUND closes out refunds we initiated. These items carry
    /// money-moving consequences, so the HMAC seal is checked first.
    async fn apply_cancel_or_refund(
        &self,
        item: NotificationRequestItem,
    ) -> Result<(), ServiceError> {
        let Some(key) = self.hmac_key.as_deref() else {
            warn!(
                psp_reference = %item.psp_reference,
                "No HMAC key configured; refusing to process CANCEL_OR_REFUND"
            );
            return Ok(());
        };
        if !verify_signature(key, &item)? {
            warn!(
                psp_reference = %item.psp_reference,
                "CANCEL_OR_REFUND failed HMAC verification"
            );
            return Ok(());
        }

        let cart = match self
            .carts
            .find_by_modification_reference(&item.psp_reference)
            .await?
        {
            Some(cart) => cart,
            None => {
                warn!(
                    psp_reference = %item.psp_reference,
                    "CANCEL_OR_REFUND for unknown modification reference"
                );
                return Ok(());
            }
        };

        if cart.status != OrderStatus::RefundInitiated {
            info!(
                cart_id = %cart.id,
                status = ?cart.status,
                "CANCEL_OR_REFUND replay ignored"
            );
            return Ok(());
        }

        let next = if item.success {
            match item.additional_data.get(MODIFICATION_ACTION_KEY).map(String::as_str) {
                Some("cancel") => OrderStatus::Cancelled,
                _ => OrderStatus::Refunded,
            }
        } else {
            OrderStatus::RefundFailed
        };
        self.settle(cart.id, next, StatusChange::default()).await
    }

    async fn settle(
        &self,
        cart_id: uuid::Uuid,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<(), ServiceError> {
        match self.carts.transition(cart_id, next, change).await {
            Ok(_) => Ok(()),
            Err(ServiceError::InvalidTransition(msg)) => {
                // Lost a race with another delivery of the same outcome.
                warn!(%cart_id, "Notification outcome no longer applicable: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Checks the item's seal: HMAC-SHA256 over the colon-joined signing fields,
/// keyed with the hex-decoded shared secret, compared against the base64
/// signature in `additionalData`. The comparison is constant-time.
fn verify_signature(key: &str, item: &NotificationRequestItem) -> Result<bool, ServiceError> {
    let Some(provided) = item.additional_data.get(HMAC_SIGNATURE_KEY) else {
        return Ok(false);
    };
    let signature = match base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        provided.as_bytes(),
    ) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };

    let key_bytes = hex::decode(key).map_err(|_| {
        ServiceError::InternalError("Webhook HMAC key is not valid hex".to_string())
    })?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|_| ServiceError::InternalError("Webhook HMAC key has invalid length".to_string()))?;
    mac.update(signing_payload(item).as_bytes());
    Ok(mac.verify_slice(&signature).is_ok())
}

/// Signing payload layout mandated by the PSP, in field order.
fn signing_payload(item: &NotificationRequestItem) -> String {
    [
        item.psp_reference.as_str(),
        item.original_reference.as_str(),
        item.merchant_account_code.as_str(),
        item.merchant_reference.as_str(),
        &item.amount.value.to_string(),
        item.amount.currency.as_str(),
        match item.event_code {
            EventCode::Authorisation => "AUTHORISATION",
            EventCode::CancelOrRefund => "CANCEL_OR_REFUND",
            EventCode::Pending => "PENDING",
            EventCode::Unknown => "",
        },
        if item.success { "true" } else { "false" },
    ]
    .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    const TEST_KEY: &str = "44782def307f23ca9cde21c2f9f1b2e8f8ad0e348b6ae6a28bcd9f4b3fbd52b7";

    fn sample_item() -> NotificationRequestItem {
        NotificationRequestItem {
            event_code: EventCode::CancelOrRefund,
            psp_reference: "MOD-9915555555555555".to_string(),
            original_reference: "PAY-8815555555555555".to_string(),
            merchant_account_code: "TestMerchant".to_string(),
            merchant_reference: "A1B2C3D4E5F6A7B8".to_string(),
            amount: NotificationAmount {
                value: 2599,
                currency: "EUR".to_string(),
            },
            success: true,
            additional_data: HashMap::new(),
        }
    }

    fn sign(key: &str, item: &NotificationRequestItem) -> String {
        let key_bytes = hex::decode(key).unwrap();
        let mut mac = HmacSha256::new_from_slice(&key_bytes).unwrap();
        mac.update(signing_payload(item).as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_correctly_sealed_item() {
        let mut item = sample_item();
        let sig = sign(TEST_KEY, &item);
        item.additional_data
            .insert(HMAC_SIGNATURE_KEY.to_string(), sig);
        assert!(verify_signature(TEST_KEY, &item).unwrap());
    }

    #[test]
    fn rejects_tampered_item() {
        let mut item = sample_item();
        let sig = sign(TEST_KEY, &item);
        item.additional_data
            .insert(HMAC_SIGNATURE_KEY.to_string(), sig);
        item.amount.value = 1;
        assert!(!verify_signature(TEST_KEY, &item).unwrap());
    }

    #[test]
    fn rejects_missing_or_garbage_signature() {
        let item = sample_item();
        assert!(!verify_signature(TEST_KEY, &item).unwrap());

        let mut item = sample_item();
        item.additional_data
            .insert(HMAC_SIGNATURE_KEY.to_string(), "!!not-base64!!".to_string());
        assert!(!verify_signature(TEST_KEY, &item).unwrap());
    }

    #[test]
    fn bad_key_is_an_error_not_a_pass() {
        let mut item = sample_item();
        item.additional_data
            .insert(HMAC_SIGNATURE_KEY.to_string(), sign(TEST_KEY, &item));
        assert!(verify_signature("zz-not-hex", &item).is_err());
    }

    #[test]
    fn success_parses_from_bool_and_string() {
        let json = r#"{"eventCode":"AUTHORISATION","success":"true"}"#;
        let item: NotificationRequestItem = serde_json::from_str(json).unwrap();
        assert!(item.success);

        let json = r#"{"eventCode":"AUTHORISATION","success":"false"}"#;
        let item: NotificationRequestItem = serde_json::from_str(json).unwrap();
        assert!(!item.success);

        let json = r#"{"eventCode":"AUTHORISATION","success":true}"#;
        let item: NotificationRequestItem = serde_json::from_str(json).unwrap();
        assert!(item.success);
    }

    #[test]
    fn unknown_event_codes_parse_without_error() {
        let json = r#"{"eventCode":"REPORT_AVAILABLE","success":"true"}"#;
        let item: NotificationRequestItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.event_code, EventCode::Unknown);
    }

    #[test]
    fn batch_wire_format_parses() {
        let json = r#"{
            "live": "false",
            "notificationItems": [
                {
                    "NotificationRequestItem": {
                        "eventCode": "AUTHORISATION",
                        "pspReference": "8815555555555555",
                        "merchantReference": "A1B2C3D4E5F6A7B8",
                        "merchantAccountCode": "TestMerchant",
                        "amount": { "value": 2599, "currency": "EUR" },
                        "success": "true",
                        "additionalData": { "hmacSignature": "abc=" }
                    }
                }
            ]
        }"#;
        let batch: NotificationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(batch.notification_items.len(), 1);
        let item = &batch.notification_items[0].notification_request_item;
        assert_eq!(item.event_code, EventCode::Authorisation);
        assert_eq!(item.psp_reference, "8815555555555555");
        assert_eq!(item.amount.value, 2599);
        assert!(item.success);
    }
}
