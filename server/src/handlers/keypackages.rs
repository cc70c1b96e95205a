//! `POST /v1/keypackages{,/fetch,/rotate}` — publish, one-shot fetch, and
//! rotate, with `served_by`/`user_home_gateway` routing metadata on fetch.

use base64::Engine;
use serde::{Deserialize, Serialize};

use axum::{extract::State, response::IntoResponse, Json};

use crate::auth::AuthUser;
use crate::error::GatewayError;
use crate::keypackages::KeyPackageService;
use crate::middleware::rate_limit::OperationLimiter;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Base64-encoded KeyPackage blobs, one per device bootstrap credential.
    pub blobs: Vec<String>,
}

pub async fn publish_keypackages(
    State(service): State<KeyPackageService>,
    State(limiter): State<std::sync::Arc<OperationLimiter>>,
    auth_user: AuthUser,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_keypackage_publish(&auth_user.device_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    for blob_b64 in &req.blobs {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(blob_b64)
            .map_err(|_| GatewayError::InvalidRequest {
                message: "blob must be valid base64".to_string(),
            })?;
        service.publish(&auth_user.device_id, &auth_user.user_id, &blob).await?;
    }

    Ok(Json(serde_json::json!({ "published": req.blobs.len() })))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Serialize)]
pub struct FetchedKeyPackageWire {
    pub blob: String,
    pub content_hash: String,
    pub served_by: String,
    pub user_home_gateway: String,
}

pub async fn fetch_keypackages(
    State(service): State<KeyPackageService>,
    State(limiter): State<std::sync::Arc<OperationLimiter>>,
    auth_user: AuthUser,
    axum::extract::Query(query): axum::extract::Query<FetchQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    limiter
        .check_keypackage_fetch(&auth_user.user_id)
        .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

    let mut fetched = Vec::new();
    for _ in 0..query.count.max(1) {
        match service.fetch(&auth_user.user_id).await {
            Ok(package) => fetched.push(FetchedKeyPackageWire {
                blob: base64::engine::general_purpose::STANDARD.encode(&package.blob),
                content_hash: package.content_hash,
                served_by: package.served_by,
                user_home_gateway: package.user_home_gateway,
            }),
            Err(GatewayError::NotFound) => break,
            Err(e) => return Err(e),
        }
    }

    if fetched.is_empty() {
        return Err(GatewayError::NotFound);
    }
    Ok(Json(fetched))
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    #[serde(default)]
    pub revoke_existing: bool,
    /// Base64-encoded replacement blobs stored atomically with the revoke.
    #[serde(default)]
    pub replacements: Vec<String>,
}

pub async fn rotate_keypackages(
    State(service): State<KeyPackageService>,
    auth_user: AuthUser,
    Json(req): Json<RotateRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let replacements = req
        .replacements
        .iter()
        .map(|blob_b64| {
            base64::engine::general_purpose::STANDARD
                .decode(blob_b64)
                .map_err(|_| GatewayError::InvalidRequest {
                    message: "replacement blob must be valid base64".to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    service
        .rotate(&auth_user.device_id, &auth_user.user_id, req.revoke_existing, &replacements)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "replaced": replacements.len() })))
}
