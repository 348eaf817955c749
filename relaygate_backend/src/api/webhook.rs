use super::{ApiError, AppState};
use crate::relay::Update;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use subtle::ConstantTimeEq;

pub(crate) const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Acknowledges immediately; the update is processed in the background so a
/// slow transport never makes the sender redeliver.
pub(crate) async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> Result<StatusCode, ApiError> {
    if let Some(expected) = state.config.webhook_secret.as_deref() {
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            tracing::warn!("webhook call with wrong secret");
            return Err(ApiError::Unauthorized);
        }
    }

    tracing::debug!(update_id = update.update_id, "update received");
    let relay = state.relay.clone();
    tokio::spawn(async move {
        relay.handle_update(update).await;
    });
    Ok(StatusCode::OK)
}
