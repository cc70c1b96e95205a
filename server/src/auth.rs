//! `AuthUser` extractor: validates the bearer `session_token` on every HTTP
//! request against the session manager, the way the ancestor's `AuthUser`
//! validated a bearer JWT against DID resolution — same extractor seam,
//! much smaller body since the gateway owns its own token format.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::GatewayError;
use crate::session::{AuthenticatedDevice, SessionManager};

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub device_id: String,
    pub user_id: String,
}

impl From<AuthenticatedDevice> for AuthUser {
    fn from(d: AuthenticatedDevice) -> Self {
        Self {
            device_id: d.device_id,
            user_id: d.user_id,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    SessionManager: axum::extract::FromRef<S>,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(GatewayError::Unauthorized)?
            .trim();

        let manager = SessionManager::from_ref(state);
        let device = manager.authenticate(token).await?;
        Ok(device.into())
    }
}
