//! `GET /v1/session/list`, `POST /v1/session/revoke`, `POST
//! /v1/session/logout_all` — all carry `Cache-Control: no-store`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::GatewayError;
use crate::middleware::rate_limit::{extract_client_ip, OperationLimiter};
use crate::models::Session;
use crate::session::SessionManager;

/// A session row with both bearer tokens stripped. `list_sessions` must
/// never hand back a live capability for a session other than the one
/// making the request.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<Session> for SessionSummary {
    fn from(s: Session) -> Self {
        Self {
            device_id: s.device_id,
            expires_at: s.expires_at,
            created_at: s.created_at,
        }
    }
}

fn no_store<T: IntoResponse>(body: T) -> impl IntoResponse {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// REST-only bootstrap for clients that never open `/v1/ws` (SSE + inbox
/// only). Not named in the distilled HTTP surface, which only lists
/// list/revoke/logout_all, but session start/resume still need a reachable
/// path for a client that only ever speaks HTTP. `user_id` is never accepted
/// here — identity comes only from `auth_token` validation.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub auth_token: String,
    pub device_id: Option<String>,
    pub device_credential: Option<String>,
}

pub async fn start(
    State(sessions): State<SessionManager>,
    State(limiter): State<Arc<OperationLimiter>>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let client_ip = extract_client_ip(&headers);
    limiter
        .check_unauthenticated_ip(&client_ip)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    let ready = sessions
        .start(&req.auth_token, req.device_id.as_deref(), req.device_credential.as_deref())
        .await?;
    Ok(no_store(Json(ready)))
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub resume_token: String,
}

pub async fn resume(
    State(sessions): State<SessionManager>,
    Json(req): Json<ResumeRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let ready = sessions.resume(&req.resume_token).await?;
    Ok(no_store(Json(ready)))
}

pub async fn list_sessions(
    State(sessions): State<SessionManager>,
    auth_user: AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let rows = sessions.list_sessions(&auth_user.user_id).await?;
    let summaries: Vec<SessionSummary> = rows.into_iter().map(SessionSummary::from).collect();
    Ok(no_store(Json(summaries)))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    /// Defaults to the calling device's own session token when omitted.
    pub session_token: Option<String>,
}

pub async fn revoke(
    State(sessions): State<SessionManager>,
    auth_user: AuthUser,
    Json(req): Json<RevokeRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    match req.session_token {
        Some(token) => sessions.revoke_session(&token).await?,
        None => sessions.revoke_device(&auth_user.device_id).await?,
    }
    Ok(no_store(Json(serde_json::json!({ "ok": true }))))
}

pub async fn logout_all(
    State(sessions): State<SessionManager>,
    auth_user: AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let revoked = sessions.logout_all(&auth_user.user_id).await?;
    Ok(no_store(Json(serde_json::json!({ "revoked": revoked }))))
}
