use axum::{extract::State, http::StatusCode, response::IntoResponse, Router, routing::post};
use bytes::Bytes;
use tracing::warn;

use crate::services::webhooks::NotificationRequest;
use crate::{errors::ServiceError, AppState};

/// Creates the router for PSP webhook endpoints. Server-to-server; no
/// shopper identity involved.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/psp", post(psp_webhook))
}

/// POST /api/webhooks/psp
///
/// The PSP retries until it sees the acknowledgment, so every outcome except
/// an unparseable body answers 200 `[accepted]`; per-item verification and
/// matching failures are logged skips inside the processor.
async fn psp_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let batch: NotificationRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!("Rejecting unparseable PSP notification: {}", e);
        ServiceError::ValidationError(format!("invalid notification body: {}", e))
    })?;

    let ack = state.services.webhooks.process_batch(batch).await?;

    Ok((StatusCode::OK, ack))
}
