use super::{ApiError, AppState};
use crate::error::RelayError;
use crate::verification::{ExternalOutcome, ExternalProof};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub(crate) struct VerifyCallbackRequest {
    session_id: String,
    user_id: i64,
    token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifyCallbackResponse {
    ok: bool,
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

pub(crate) async fn verify_callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<VerifyCallbackRequest>,
) -> Result<Json<VerifyCallbackResponse>, ApiError> {
    if req.session_id.trim().is_empty() || req.token.trim().is_empty() {
        return Err(ApiError::BadRequest("invalid request".into()));
    }
    let proof = ExternalProof {
        token: req.token,
        remote_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };
    match state
        .relay
        .handle_external_proof(&req.session_id, req.user_id, proof)
        .await
    {
        Ok(ExternalOutcome::FinalizeIssued) => Ok(Json(VerifyCallbackResponse { ok: true })),
        Ok(ExternalOutcome::Reissued) | Err(RelayError::Validation(_)) => {
            Err(ApiError::BadRequest("invalid request".into()))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_address_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.9"));
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)).as_deref(), Some("127.0.0.1"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
