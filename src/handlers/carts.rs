use crate::handlers::common::success_response;
use crate::{auth::CurrentUser, entities, errors::ServiceError, AppState};
use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/{line_id}", delete(remove_item))
        .route("/{cart_id}/refund", post(request_refund))
}

/// Cart plus its lines, the shape every cart endpoint replies with.
#[derive(Debug, Serialize)]
pub struct CartView {
    #[serde(flatten)]
    pub cart: entities::cart::Model,
    pub items: Vec<entities::cart_item::Model>,
}

/// Get the shopper's open cart with its lines
async fn get_cart(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let (cart, items) = state.services.carts.open_cart_with_items(owner).await?;

    Ok(success_response(CartView { cart, items }))
}

/// Add one unit of a product to the shopper's cart
async fn add_item(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    state
        .services
        .carts
        .add_product(owner, payload.product_id)
        .await?;

    let (cart, items) = state.services.carts.open_cart_with_items(owner).await?;

    Ok(success_response(CartView { cart, items }))
}

/// Remove a line from the shopper's cart
async fn remove_item(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(line_id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    state.services.carts.remove_line(owner, line_id).await?;

    let (cart, items) = state.services.carts.open_cart_with_items(owner).await?;

    Ok(success_response(CartView { cart, items }))
}

/// Request a refund of a paid cart
async fn request_refund(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(cart_id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ServiceError> {
    let cart = state
        .services
        .checkout
        .request_refund(owner, cart_id)
        .await?;

    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
}
