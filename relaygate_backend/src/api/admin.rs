use super::{ApiError, ApiResult, AppState};
use crate::admin::{Overview, UserStatus};
use crate::settings::SettingsSnapshot;
use crate::verification::VerificationState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

#[derive(Deserialize)]
pub(crate) struct SetSettingRequest {
    value: String,
}

#[derive(Serialize)]
pub(crate) struct WipeResponse {
    removed: usize,
}

/// Admin routes are closed entirely when no token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .unwrap_or_default();
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

pub(crate) async fn overview_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Overview> {
    authorize(&state, &headers)?;
    Ok(Json(state.admin.overview().await?))
}

pub(crate) async fn user_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> ApiResult<UserStatus> {
    authorize(&state, &headers)?;
    let status = state.admin.status(user_id).await?;
    let unknown = !status.banned
        && !status.trusted
        && status.record.is_none()
        && status.pending.is_empty()
        && status.verification == VerificationState::Unverified;
    if unknown {
        return Err(ApiError::NotFound(format!("no data for user {user_id}")));
    }
    Ok(Json(status))
}

pub(crate) async fn ban_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.ban(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn unban_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.unban(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn trust_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.trust(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn untrust_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.untrust(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn wipe_user_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.wipe_user(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn wipe_all_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<WipeResponse> {
    authorize(&state, &headers)?;
    let removed = state.admin.wipe_all().await?;
    Ok(Json(WipeResponse { removed }))
}

pub(crate) async fn set_setting_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(req): Json<SetSettingRequest>,
) -> ApiResult<SettingsSnapshot> {
    authorize(&state, &headers)?;
    Ok(Json(state.admin.set(&key, &req.value).await?))
}

pub(crate) async fn reset_quota_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.admin.reset_quota_breaker().await?;
    Ok(StatusCode::NO_CONTENT)
}
