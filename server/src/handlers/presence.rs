//! `POST /v1/presence/{lease,renew,watch,unwatch}` — all responses carry
//! `Cache-Control: no-store` since a lease or watch state is never safe to
//! cache behind a shared proxy.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::GatewayError;
use crate::middleware::rate_limit::OperationLimiter;
use crate::presence::PresenceService;

fn no_store<T: IntoResponse>(body: T) -> impl IntoResponse {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[derive(Debug, Deserialize)]
pub struct LeaseRequest {
    pub status: String,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: i64,
    #[serde(default)]
    pub invisible: bool,
}

fn default_ttl() -> i64 {
    60
}

#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn lease(
    State(service): State<Arc<PresenceService>>,
    State(limiter): State<Arc<OperationLimiter>>,
    auth_user: AuthUser,
    Json(req): Json<LeaseRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_presence_op(&auth_user.device_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    let result = service
        .lease(&auth_user.device_id, &auth_user.user_id, &req.status, req.ttl_seconds, req.invisible)
        .await?;
    Ok(no_store(Json(LeaseResponse { expires_at: result.expires_at })))
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: i64,
}

pub async fn renew(
    State(service): State<Arc<PresenceService>>,
    State(limiter): State<Arc<OperationLimiter>>,
    auth_user: AuthUser,
    Json(req): Json<RenewRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_presence_op(&auth_user.device_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    let result = service
        .renew(&auth_user.device_id, &auth_user.user_id, req.ttl_seconds)
        .await?;
    Ok(no_store(Json(LeaseResponse { expires_at: result.expires_at })))
}

#[derive(Debug, Deserialize)]
pub struct WatchRequest {
    pub target_user_id: String,
}

pub async fn watch(
    State(service): State<Arc<PresenceService>>,
    State(limiter): State<Arc<OperationLimiter>>,
    auth_user: AuthUser,
    Json(req): Json<WatchRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_presence_op(&auth_user.device_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    service.watch(&auth_user.user_id, &req.target_user_id).await?;
    Ok(no_store(Json(serde_json::json!({ "ok": true }))))
}

pub async fn unwatch(
    State(service): State<Arc<PresenceService>>,
    State(limiter): State<Arc<OperationLimiter>>,
    auth_user: AuthUser,
    Json(req): Json<WatchRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_presence_op(&auth_user.device_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    service.unwatch(&auth_user.user_id, &req.target_user_id).await?;
    Ok(no_store(Json(serde_json::json!({ "ok": true }))))
}
