use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::cart::{OrderStatus, PaymentMethod};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::psp::{
    self, Amount, PaymentDetailsRequest, PaymentMethodsRequest, PaymentRequest, PspGateway,
    ResultCode,
};
use crate::services::carts::{CartService, StatusChange};
use crate::services::payment_correlation::{NewCorrelation, PaymentCorrelationService};

const CHANNEL_WEB: &str = "Web";

/// Client input for initiating a payment. `payment_details` is the opaque
/// state assembled by the PSP's front-end widget; when absent, a minimal
/// `{"type": …}` method object is sent.
#[derive(Debug, Deserialize)]
pub struct InitiatePaymentInput {
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_details: Option<Value>,
    #[serde(default)]
    pub browser_info: Option<Value>,
}

/// What the front end needs to continue after an initiation call: the PSP
/// verdict, our order reference, and the redirect action when one is required.
#[derive(Debug, Serialize)]
pub struct PaymentOutcome {
    pub result_code: ResultCode,
    pub order_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<psp::RedirectAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<String>,
}

/// Result of a completed redirect round-trip: where to send the browser.
#[derive(Debug, Serialize)]
pub struct RedirectOutcome {
    pub result_code: ResultCode,
    pub destination: String,
}

/// Drives a cart through payment: initiation with the PSP, redirect
/// completion via the correlation cache, 3DS detail pass-through, and refund
/// initiation. All state changes funnel through [`CartService::transition`].
#[derive(Clone)]
pub struct CheckoutService {
    carts: CartService,
    correlations: PaymentCorrelationService,
    gateway: Arc<dyn PspGateway>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CheckoutService {
    pub fn new(
        carts: CartService,
        correlations: PaymentCorrelationService,
        gateway: Arc<dyn PspGateway>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            carts,
            correlations,
            gateway,
            event_sender,
            config,
        }
    }

    /// Lists payment methods applicable to the owner's active cart total.
    #[instrument(skip(self))]
    pub async fn payment_methods(&self, owner: Uuid) -> Result<Value, ServiceError> {
        let cart = self
            .carts
            .find_active_cart(owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No active cart for owner {}", owner)))?;

        let request = PaymentMethodsRequest {
            amount: self.wire_amount(cart.total_price)?,
            country_code: self.config.country_code.clone(),
            shopper_locale: self.config.shopper_locale.clone(),
            channel: CHANNEL_WEB.to_string(),
        };
        self.gateway.payment_methods(request).await
    }

    /// Initiates payment of the owner's open cart.
    ///
    /// The cart is parked in `PendingPayment` before the authorisation call
    /// goes out: if the PSP times out, a reference may already exist on their
    /// side, so the cart must not silently fall back to `Open` (and must never
    /// re-authorise under a fresh reference without reconciliation).
    #[instrument(skip(self, input), fields(payment_method = ?input.payment_method))]
    pub async fn initiate_payment(
        &self,
        owner: Uuid,
        referrer: &str,
        input: InitiatePaymentInput,
    ) -> Result<PaymentOutcome, ServiceError> {
        let origin = front_end_origin(referrer)?;

        let cart = self
            .carts
            .find_active_cart(owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No active cart for owner {}", owner)))?;
        if cart.status != OrderStatus::Open {
            return Err(ServiceError::InvalidTransition(format!(
                "Cart {} is {:?}; a payment is already underway",
                cart.id, cart.status
            )));
        }

        // Totals are frozen by the transition below; convert before it so a
        // conversion failure cannot strand the cart in PendingPayment.
        let amount = self.wire_amount(cart.total_price)?;
        let order_ref = generate_order_ref();

        let cart = self
            .carts
            .transition(
                cart.id,
                OrderStatus::PendingPayment,
                StatusChange {
                    payment_method: Some(input.payment_method),
                    order_reference: Some(order_ref.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id: cart.id,
                order_ref: order_ref.clone(),
            })
            .await;

        let payment_method = input
            .payment_details
            .unwrap_or_else(|| serde_json::json!({ "type": input.payment_method.psp_type() }));
        let request = PaymentRequest {
            amount,
            reference: order_ref.clone(),
            payment_method,
            return_url: format!("{}/redirect?orderRef={}", origin, order_ref),
            country_code: self.config.country_code.clone(),
            shopper_locale: self.config.shopper_locale.clone(),
            channel: CHANNEL_WEB.to_string(),
            shopper_reference: Some(owner.to_string()),
            browser_info: input.browser_info,
        };

        let response = self.gateway.authorise(request).await?;

        match response.result_code {
            ResultCode::Authorised => {
                self.carts
                    .transition(
                        cart.id,
                        OrderStatus::Paid,
                        StatusChange {
                            payment_reference: response.psp_reference.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(PaymentOutcome {
                    result_code: response.result_code,
                    order_ref,
                    redirect: None,
                    refusal_reason: None,
                })
            }
            ResultCode::Pending | ResultCode::Received => {
                self.carts
                    .transition(
                        cart.id,
                        OrderStatus::Pending,
                        StatusChange {
                            payment_reference: response.psp_reference.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(PaymentOutcome {
                    result_code: response.result_code,
                    order_ref,
                    redirect: None,
                    refusal_reason: None,
                })
            }
            ResultCode::Refused => {
                self.carts
                    .transition(
                        cart.id,
                        OrderStatus::Cancelled,
                        StatusChange {
                            payment_reference: response.psp_reference.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(PaymentOutcome {
                    result_code: response.result_code,
                    order_ref,
                    redirect: None,
                    refusal_reason: response.refusal_reason,
                })
            }
            ResultCode::RedirectShopper => {
                let continuation = response.continuation_data().ok_or_else(|| {
                    ServiceError::PaymentFailed(
                        "PSP requested a redirect without continuation data".to_string(),
                    )
                })?;
                self.correlations
                    .create(NewCorrelation {
                        order_ref: order_ref.clone(),
                        continuation_data: continuation.to_string(),
                        payment_method_type: input.payment_method.psp_type().to_string(),
                        originating_referrer: origin,
                        customer_id: owner,
                    })
                    .await?;
                info!(cart_id = %cart.id, %order_ref, "Redirect step required; correlation entry stored");
                Ok(PaymentOutcome {
                    result_code: response.result_code,
                    order_ref,
                    redirect: response.action,
                    refusal_reason: None,
                })
            }
            other => {
                // Unusable verdict: keep the cart parked for reconciliation
                // rather than guessing an outcome.
                warn!(cart_id = %cart.id, code = ?other, "Unhandled PSP result code at initiation");
                Err(ServiceError::PaymentFailed(format!(
                    "PSP returned {:?}",
                    other
                )))
            }
        }
    }

    /// Pass-through for 3-D-Secure detail submission during on-page flows.
    /// The state change for these payments arrives by webhook or redirect.
    #[instrument(skip(self, payment_data, details))]
    pub async fn submit_details(
        &self,
        payment_data: Option<String>,
        details: HashMap<String, String>,
    ) -> Result<psp::PaymentDetailsResponse, ServiceError> {
        self.gateway
            .payment_details(PaymentDetailsRequest {
                payment_data,
                details,
            })
            .await
    }

    /// Completes a redirect round-trip keyed by `order_ref`.
    ///
    /// The correlation entry is the sole source of trust: the owner, the
    /// continuation blob, and the destination origin all come from it, never
    /// from the returning request. The entry is deleted once the PSP gives a
    /// definitive answer; a transport error leaves it in place for a retry.
    #[instrument(skip(self, payload))]
    pub async fn complete_redirect(
        &self,
        order_ref: &str,
        payload: HashMap<String, String>,
    ) -> Result<RedirectOutcome, ServiceError> {
        let entry = self.correlations.find_valid(order_ref).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No payment in flight for reference {}", order_ref))
        })?;

        let response = self
            .gateway
            .payment_details(PaymentDetailsRequest {
                payment_data: Some(entry.continuation_data.clone()),
                details: payload,
            })
            .await?;

        let target = match response.result_code {
            ResultCode::Authorised => Some(OrderStatus::Paid),
            ResultCode::Pending | ResultCode::Received => Some(OrderStatus::Pending),
            ResultCode::Refused => Some(OrderStatus::Cancelled),
            _ => None,
        };

        if let Some(next) = target {
            match self.carts.find_awaiting_payment(entry.customer_id).await? {
                Some(cart) => {
                    let change = StatusChange {
                        payment_reference: response.psp_reference.clone(),
                        ..Default::default()
                    };
                    match self.carts.transition(cart.id, next, change).await {
                        Ok(_) => {}
                        Err(ServiceError::InvalidTransition(msg)) => {
                            // A webhook or a concurrent completion got there
                            // first; the redirect still resolves for the
                            // shopper.
                            warn!(%order_ref, "Redirect outcome already applied: {}", msg);
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    info!(%order_ref, "No cart awaiting payment; outcome was settled earlier");
                }
            }
        } else {
            warn!(%order_ref, code = ?response.result_code, "Redirect completed without a mappable outcome");
        }

        self.correlations.delete(order_ref).await?;

        Ok(RedirectOutcome {
            result_code: response.result_code,
            destination: format!(
                "{}/status/{}?reason={:?}&paymentType={}",
                entry.originating_referrer,
                shopper_status(response.result_code),
                response.result_code,
                entry.payment_method_type
            ),
        })
    }

    /// Requests a refund of the owner's paid cart. The PSP's modification
    /// reference is recorded for webhook reconciliation; settlement arrives
    /// asynchronously as a cancel-or-refund event.
    #[instrument(skip(self))]
    pub async fn request_refund(
        &self,
        owner: Uuid,
        cart_id: Uuid,
    ) -> Result<crate::entities::cart::Model, ServiceError> {
        let cart = self
            .carts
            .find_by_id(cart_id)
            .await?
            .filter(|cart| cart.customer_id == owner)
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != OrderStatus::Paid {
            return Err(ServiceError::InvalidTransition(format!(
                "Cart {} is {:?}, only paid carts can be refunded",
                cart_id, cart.status
            )));
        }
        let reference = cart.payment_reference.as_deref().ok_or_else(|| {
            ServiceError::InvalidTransition(format!("Cart {} has no payment reference", cart_id))
        })?;

        let modification = self.gateway.cancel_or_refund(reference).await?;

        let updated = self
            .carts
            .transition(
                cart.id,
                OrderStatus::RefundInitiated,
                StatusChange {
                    modification_reference: Some(modification.psp_reference),
                    ..Default::default()
                },
            )
            .await?;

        self.event_sender
            .send_or_log(Event::RefundRequested { cart_id })
            .await;

        Ok(updated)
    }

    fn wire_amount(&self, total: rust_decimal::Decimal) -> Result<Amount, ServiceError> {
        Ok(Amount {
            currency: self.config.default_currency.clone(),
            value: psp::to_minor_units(total)?,
        })
    }
}

/// Shopper-facing status page segment for a PSP verdict.
fn shopper_status(code: ResultCode) -> &'static str {
    match code {
        ResultCode::Authorised => "success",
        ResultCode::Pending | ResultCode::Received => "pending",
        ResultCode::Refused => "failed",
        _ => "error",
    }
}

/// Validated origin of the shopper's front end, derived from the Referer
/// header. Only the origin is kept; paths and queries are never echoed back.
fn front_end_origin(referrer: &str) -> Result<String, ServiceError> {
    let url = Url::parse(referrer)
        .map_err(|_| ServiceError::ValidationError(format!("Invalid referrer: {}", referrer)))?;
    match url.origin() {
        url::Origin::Tuple(..) => Ok(url.origin().ascii_serialization()),
        url::Origin::Opaque(_) => Err(ServiceError::ValidationError(format!(
            "Referrer has no usable origin: {}",
            referrer
        ))),
    }
}

fn generate_order_ref() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shopper_status_segments() {
        assert_eq!(shopper_status(ResultCode::Authorised), "success");
        assert_eq!(shopper_status(ResultCode::Pending), "pending");
        assert_eq!(shopper_status(ResultCode::Received), "pending");
        assert_eq!(shopper_status(ResultCode::Refused), "failed");
        assert_eq!(shopper_status(ResultCode::Error), "error");
        assert_eq!(shopper_status(ResultCode::Unknown), "error");
    }

    #[test]
    fn front_end_origin_strips_path_and_query() {
        assert_eq!(
            front_end_origin("https://shop.example/cart?step=2").unwrap(),
            "https://shop.example"
        );
        assert_eq!(
            front_end_origin("http://localhost:3000/checkout").unwrap(),
            "http://localhost:3000"
        );
    }

    #[test]
    fn front_end_origin_rejects_junk() {
        assert!(front_end_origin("not a url").is_err());
        assert!(front_end_origin("data:text/plain,hello").is_err());
    }

    #[test]
    fn order_refs_are_opaque_tokens() {
        let a = generate_order_ref();
        let b = generate_order_ref();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
