use std::collections::HashMap;

use crate::handlers::common::success_response;
use crate::{
    auth::CurrentUser,
    errors::ServiceError,
    services::checkout::InitiatePaymentInput,
    AppState,
};
use axum::{
    extract::{Form, Json, Query, State},
    http::{header, HeaderMap},
    response::Redirect,
    routing::{get, post},
    Router,
};
use serde::Serialize;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_config))
        .route("/payment-methods", post(payment_methods))
        .route("/payment", post(initiate_payment))
        .route("/details", post(submit_details))
        .route("/redirect", get(complete_redirect_get))
        .route("/redirect", post(complete_redirect_post))
}

/// What the payment widget needs to boot. Only the public client key is
/// exposed; the API key never leaves the server.
#[derive(Debug, Serialize)]
struct CheckoutConfig {
    client_key: Option<String>,
    environment: &'static str,
    currency: String,
    country_code: String,
    shopper_locale: String,
}

/// Front-end checkout configuration
async fn get_config(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let config = &state.config;
    let environment = if config.psp_checkout_url.contains("test") {
        "test"
    } else {
        "live"
    };

    Ok(success_response(CheckoutConfig {
        client_key: config.psp_client_key.clone(),
        environment,
        currency: config.default_currency.clone(),
        country_code: config.country_code.clone(),
        shopper_locale: config.shopper_locale.clone(),
    }))
}

/// Payment methods applicable to the shopper's cart, relayed from the PSP
async fn payment_methods(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let methods = state.services.checkout.payment_methods(owner).await?;

    Ok(success_response(methods))
}

/// Initiate payment of the shopper's cart
async fn initiate_payment(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<InitiatePaymentInput>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let referrer = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ServiceError::ValidationError(
                "Referer header is required to build the return URL".to_string(),
            )
        })?;

    let outcome = state
        .services
        .checkout
        .initiate_payment(owner, referrer, payload)
        .await?;

    Ok(success_response(outcome))
}

/// Pass-through 3-D-Secure detail submission
async fn submit_details(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Json(payload): Json<crate::psp::PaymentDetailsRequest>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let response = state
        .services
        .checkout
        .submit_details(payload.payment_data, payload.details)
        .await?;

    Ok(success_response(response))
}

/// Redirect return, query-string shape. The PSP appends its outcome payload
/// to the return URL we supplied at initiation.
async fn complete_redirect_get(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<Redirect, ServiceError> {
    let order_ref = params.remove("orderRef").ok_or_else(|| {
        ServiceError::ValidationError("orderRef query parameter is required".to_string())
    })?;

    finish_redirect(&state, &order_ref, params).await
}

/// Redirect return, form-post shape (3-D-Secure `MD`/`PaRes` pair). The
/// order reference rides on the query string of the return URL.
async fn complete_redirect_post(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Form(mut form): Form<HashMap<String, String>>,
) -> Result<Redirect, ServiceError> {
    let order_ref = params
        .get("orderRef")
        .cloned()
        .or_else(|| form.remove("orderRef"))
        .ok_or_else(|| {
            ServiceError::ValidationError("orderRef parameter is required".to_string())
        })?;

    finish_redirect(&state, &order_ref, form).await
}

async fn finish_redirect(
    state: &AppState,
    order_ref: &str,
    payload: HashMap<String, String>,
) -> Result<Redirect, ServiceError> {
    let outcome = state
        .services
        .checkout
        .complete_redirect(order_ref, payload)
        .await?;

    // 303 so the shopper's browser lands on the status page with a GET.
    Ok(Redirect::to(&outcome.destination))
}
