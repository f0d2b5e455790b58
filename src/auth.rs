use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Header carrying the shopper identity, set by the session layer in front
/// of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated shopper. Handlers that take this extractor reject
/// requests without a parseable `x-user-id` header with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ServiceError::Unauthorized(format!("Missing {} header", USER_ID_HEADER))
            })?;
        let id = Uuid::parse_str(raw).map_err(|_| {
            ServiceError::Unauthorized(format!("Malformed {} header", USER_ID_HEADER))
        })?;
        Ok(CurrentUser(id))
    }
}
