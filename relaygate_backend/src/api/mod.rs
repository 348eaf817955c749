mod admin;
mod verify;
mod webhook;

use crate::admin::AdminService;
use crate::config::ApiConfig;
use crate::error::RelayError;
use crate::relay::RelayService;
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub relay: RelayService,
    pub admin: AdminService,
}

pub(crate) type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn into_response_parts(self) -> (StatusCode, ErrorResponse) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse { message: msg }),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    message: "unauthorized".into(),
                },
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse { message: msg }),
            ApiError::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        message: "internal server error".into(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.into_response_parts();
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Validation(reason) => ApiError::BadRequest(reason),
            other => ApiError::Internal(other.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    quota_breaker_tripped: bool,
    bot_enabled: bool,
    spam_enabled: bool,
    verify_provider: String,
}

async fn health_handler(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let overview = state.admin.overview().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        quota_breaker_tripped: overview.quota_breaker_tripped,
        bot_enabled: overview.settings.bot_enabled,
        spam_enabled: overview.settings.spam_enabled,
        verify_provider: overview.settings.verify_provider.to_string(),
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhook", post(webhook::webhook_handler))
        .route("/verify/callback", post(verify::verify_callback_handler))
        .route("/admin/overview", get(admin::overview_handler))
        .route("/admin/users/:user_id", get(admin::user_status_handler))
        .route("/admin/users/:user_id/ban", post(admin::ban_handler).delete(admin::unban_handler))
        .route("/admin/users/:user_id/trust", post(admin::trust_handler).delete(admin::untrust_handler))
        .route("/admin/users/:user_id/wipe", post(admin::wipe_user_handler))
        .route("/admin/wipe", post(admin::wipe_all_handler))
        .route("/admin/settings/:key", axum::routing::put(admin::set_setting_handler))
        .route("/admin/quota/reset", post(admin::reset_quota_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(?addr, "HTTP server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub async fn serve_http(state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}
