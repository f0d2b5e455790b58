//! Client for the external payment service provider (PSP).
//!
//! The store talks to two PSP surfaces: the checkout API (payment method
//! listing, authorisation, redirect/3DS completion) and the modification API
//! (cancel-or-refund). Both are consumed through [`PspGateway`] so the
//! checkout flow can be exercised against a scripted gateway in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::config::AppConfig;
use crate::errors::ServiceError;

/// Money on the PSP wire: integer minor units plus an ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub currency: String,
    pub value: i64,
}

/// Converts a decimal major-unit amount to the PSP's integer minor units.
/// Rounds half-up at two decimal places before scaling, so `10.005` becomes
/// `1001` and `0.004` becomes `0`. Negative amounts are refused outright.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "amount must not be negative: {}",
            amount
        )));
    }
    let cents =
        amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero) * Decimal::ONE_HUNDRED;
    cents.to_i64().ok_or_else(|| {
        ServiceError::ValidationError(format!("amount out of range for minor units: {}", amount))
    })
}

/// PSP result codes this store acts on. Codes the PSP may add later fall into
/// `Unknown` and are treated as errors by the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Authorised,
    Pending,
    Received,
    Refused,
    RedirectShopper,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodsRequest {
    pub amount: Amount,
    pub country_code: String,
    pub shopper_locale: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: Amount,
    /// Store-generated order reference; echoed back by webhooks as
    /// `merchantReference`.
    pub reference: String,
    /// Opaque payment-method state assembled by the front-end widget.
    pub payment_method: Value,
    pub return_url: String,
    pub country_code: String,
    pub shopper_locale: String,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shopper_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_info: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub result_code: ResultCode,
    #[serde(default)]
    pub psp_reference: Option<String>,
    #[serde(default)]
    pub action: Option<RedirectAction>,
    /// Continuation blob for redirect flows (top-level on older API versions).
    #[serde(default)]
    pub payment_data: Option<String>,
    #[serde(default)]
    pub refusal_reason: Option<String>,
}

impl PaymentResponse {
    /// The continuation data needed to complete a redirect flow, wherever the
    /// PSP put it.
    pub fn continuation_data(&self) -> Option<&str> {
        self.payment_data
            .as_deref()
            .or_else(|| self.action.as_ref().and_then(|a| a.payment_data.as_deref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub payment_data: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetailsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_data: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetailsResponse {
    pub result_code: ResultCode,
    #[serde(default)]
    pub psp_reference: Option<String>,
    #[serde(default)]
    pub refusal_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationResponse {
    pub psp_reference: String,
    #[serde(default)]
    pub response: Option<String>,
}

#[async_trait]
pub trait PspGateway: Send + Sync {
    async fn payment_methods(&self, req: PaymentMethodsRequest) -> Result<Value, ServiceError>;

    async fn authorise(&self, req: PaymentRequest) -> Result<PaymentResponse, ServiceError>;

    async fn payment_details(
        &self,
        req: PaymentDetailsRequest,
    ) -> Result<PaymentDetailsResponse, ServiceError>;

    async fn cancel_or_refund(
        &self,
        original_reference: &str,
    ) -> Result<ModificationResponse, ServiceError>;
}

/// Wire envelope: every PSP request carries the merchant account alongside the
/// caller-supplied body.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MerchantBody<'a, T: Serialize> {
    merchant_account: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModificationRequest<'a> {
    merchant_account: &'a str,
    original_reference: &'a str,
}

/// reqwest-backed [`PspGateway`] with a bounded per-request timeout. Timeouts,
/// connection failures and PSP 5xx responses surface as the retryable
/// [`ServiceError::PspUnavailable`]; a 4xx means the store sent something the
/// PSP rejects and is reported as a payment failure.
pub struct HttpPspGateway {
    client: Client,
    checkout_url: String,
    modification_url: String,
    api_key: String,
    merchant_account: String,
}

impl HttpPspGateway {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.psp_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("building PSP client: {}", e)))?;

        Ok(Self {
            client,
            checkout_url: config.psp_checkout_url.trim_end_matches('/').to_string(),
            modification_url: config.psp_modification_url.trim_end_matches('/').to_string(),
            api_key: config.psp_api_key.clone(),
            merchant_account: config.psp_merchant_account.clone(),
        })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<R, ServiceError> {
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::PspUnavailable(format!("timeout calling {}", url))
                } else {
                    ServiceError::PspUnavailable(format!("transport error calling {}: {}", url, e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ServiceError::PspUnavailable(format!(
                "{} answered {}",
                url, status
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%url, %status, "PSP rejected request");
            return Err(ServiceError::PaymentFailed(format!(
                "PSP rejected request with {}: {}",
                status, detail
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ServiceError::PspUnavailable(format!("invalid reply from {}: {}", url, e)))
    }
}

#[async_trait]
impl PspGateway for HttpPspGateway {
    #[instrument(skip_all)]
    async fn payment_methods(&self, req: PaymentMethodsRequest) -> Result<Value, ServiceError> {
        let url = format!("{}/paymentMethods", self.checkout_url);
        self.post(
            url,
            &MerchantBody {
                merchant_account: &self.merchant_account,
                body: &req,
            },
        )
        .await
    }

    #[instrument(skip_all, fields(reference = %req.reference))]
    async fn authorise(&self, req: PaymentRequest) -> Result<PaymentResponse, ServiceError> {
        let url = format!("{}/payments", self.checkout_url);
        self.post(
            url,
            &MerchantBody {
                merchant_account: &self.merchant_account,
                body: &req,
            },
        )
        .await
    }

    #[instrument(skip_all)]
    async fn payment_details(
        &self,
        req: PaymentDetailsRequest,
    ) -> Result<PaymentDetailsResponse, ServiceError> {
        let url = format!("{}/payments/details", self.checkout_url);
        self.post(url, &req).await
    }

    #[instrument(skip_all, fields(original_reference = %original_reference))]
    async fn cancel_or_refund(
        &self,
        original_reference: &str,
    ) -> Result<ModificationResponse, ServiceError> {
        let url = format!("{}/cancelOrRefund", self.modification_url);
        self.post(
            url,
            &ModificationRequest {
                merchant_account: &self.merchant_account,
                original_reference,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_for_exact_cents() {
        assert_eq!(to_minor_units(dec!(10.00)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(19.99)).unwrap(), 1999);
        assert_eq!(to_minor_units(dec!(0)).unwrap(), 0);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
    }

    #[test]
    fn minor_units_round_half_up_past_two_decimals() {
        // The case the naive truncation got wrong
        assert_eq!(to_minor_units(dec!(10.005)).unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(10.004)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(0.004)).unwrap(), 0);
        assert_eq!(to_minor_units(dec!(0.005)).unwrap(), 1);
    }

    #[test]
    fn minor_units_reject_negative_amounts() {
        assert!(matches!(
            to_minor_units(dec!(-0.01)),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn minor_units_reject_out_of_range() {
        assert!(matches!(
            to_minor_units(Decimal::MAX),
            Err(ServiceError::ValidationError(_))
        ));
    }

    proptest! {
        #[test]
        fn minor_units_identity_on_two_decimal_amounts(cents in 0i64..1_000_000_000_000) {
            let amount = Decimal::new(cents, 2);
            prop_assert_eq!(to_minor_units(amount).unwrap(), cents);
        }
    }

    #[test]
    fn unknown_result_codes_parse_as_unknown() {
        let parsed: ResultCode = serde_json::from_str("\"Authorised\"").unwrap();
        assert_eq!(parsed, ResultCode::Authorised);

        let parsed: ResultCode = serde_json::from_str("\"PresentToShopper\"").unwrap();
        assert_eq!(parsed, ResultCode::Unknown);
    }

    #[test]
    fn payment_response_finds_continuation_data_in_action() {
        let body = serde_json::json!({
            "resultCode": "RedirectShopper",
            "action": {
                "type": "redirect",
                "url": "https://psp.example/redirect",
                "method": "GET",
                "paymentData": "blob-from-action"
            }
        });
        let parsed: PaymentResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.result_code, ResultCode::RedirectShopper);
        assert_eq!(parsed.continuation_data(), Some("blob-from-action"));
        assert!(parsed.psp_reference.is_none());
    }

    #[test]
    fn merchant_body_flattens_into_wire_shape() {
        let req = PaymentMethodsRequest {
            amount: Amount {
                currency: "EUR".into(),
                value: 1000,
            },
            country_code: "NL".into(),
            shopper_locale: "nl-NL".into(),
            channel: "Web".into(),
        };
        let wire = serde_json::to_value(MerchantBody {
            merchant_account: "StoreAccount",
            body: &req,
        })
        .unwrap();

        assert_eq!(wire["merchantAccount"], "StoreAccount");
        assert_eq!(wire["amount"]["value"], 1000);
        assert_eq!(wire["countryCode"], "NL");
        assert_eq!(wire["channel"], "Web");
    }
}
