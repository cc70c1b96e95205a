//! Session manager: validates `session.start`/`session.resume`, mints
//! opaque bearer capabilities, and handles revocation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::{self, DbPool};
use crate::error::GatewayError;
use crate::models::Cursor;

fn random_token(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorEntry {
    pub conv_id: String,
    pub next_seq: i64,
}

impl From<Cursor> for CursorEntry {
    fn from(c: Cursor) -> Self {
        Self {
            conv_id: c.conv_id,
            next_seq: c.next_seq,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReady {
    pub session_token: String,
    pub resume_token: String,
    pub expires_at: DateTime<Utc>,
    pub cursors: Vec<CursorEntry>,
    #[serde(skip)]
    pub device_id: String,
    #[serde(skip)]
    pub user_id: String,
}

#[derive(Clone)]
pub struct SessionManager {
    pool: DbPool,
    session_ttl_seconds: i64,
    auth_shared_secret: Option<String>,
}

impl SessionManager {
    pub fn new(pool: DbPool, session_ttl_seconds: i64, auth_shared_secret: Option<String>) -> Self {
        Self {
            pool,
            session_ttl_seconds,
            auth_shared_secret,
        }
    }

    /// Validates an opaque `auth_token` from the identity issuer and derives
    /// the caller's `user_id` from it. Identity issuance itself is out of
    /// scope for the gateway (spec §1), so the gateway never trusts a
    /// separately-supplied `user_id` field — the token is the only source of
    /// identity. In single-tenant deployments the issuer mints tokens shaped
    /// `"{shared_secret}:{user_id}"`, matching the ancestor's dev-mode HS256
    /// path but without any JWT parsing, since the gateway never needs to
    /// inspect claims beyond "is this valid, and whose is it".
    fn validate_auth_token(&self, auth_token: &str) -> Result<String, GatewayError> {
        if auth_token.is_empty() {
            return Err(GatewayError::Unauthorized);
        }
        match &self.auth_shared_secret {
            Some(secret) if !secret.is_empty() => auth_token
                .strip_prefix(&format!("{secret}:"))
                .filter(|user_id| !user_id.is_empty())
                .map(|user_id| user_id.to_string())
                .ok_or(GatewayError::Unauthorized),
            _ => {
                // dev/test default: there is no issuer to consult, so the
                // identity is derived deterministically from the token
                // itself rather than trusted from an unverified field.
                let digest = Sha256::digest(auth_token.as_bytes());
                Ok(format!("devuser_{}", hex::encode(&digest[..8])))
            }
        }
    }

    pub async fn start(
        &self,
        auth_token: &str,
        device_id: Option<&str>,
        device_credential: Option<&str>,
    ) -> Result<SessionReady, GatewayError> {
        let user_id = self.validate_auth_token(auth_token)?;

        let device_id = device_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let credential = device_credential.unwrap_or("").to_string();

        db::ensure_device(&self.pool, &device_id, &user_id, &credential).await?;

        let session_token = random_token("sess");
        let resume_token = random_token("resume");
        let expires_at = Utc::now() + ChronoDuration::seconds(self.session_ttl_seconds);

        db::insert_session(
            &self.pool,
            &session_token,
            &resume_token,
            &device_id,
            &user_id,
            expires_at,
        )
        .await?;

        let cursors = db::list_cursors(&self.pool, &device_id)
            .await?
            .into_iter()
            .map(CursorEntry::from)
            .collect();

        Ok(SessionReady {
            session_token,
            resume_token,
            expires_at,
            cursors,
            device_id,
            user_id,
        })
    }

    /// Resumes a session. Single-use: the presented `resume_token` is
    /// atomically replaced, so a second use of the same token fails.
    pub async fn resume(&self, resume_token: &str) -> Result<SessionReady, GatewayError> {
        let existing = db::get_session_by_resume_token(&self.pool, resume_token)
            .await?
            .ok_or(GatewayError::ResumeFailed)?;

        if !existing.is_active(Utc::now()) {
            return Err(GatewayError::ResumeFailed);
        }

        let new_session_token = random_token("sess");
        let new_resume_token = random_token("resume");
        let new_expires_at = Utc::now() + ChronoDuration::seconds(self.session_ttl_seconds);

        let updated = db::rotate_session(
            &self.pool,
            resume_token,
            &new_session_token,
            &new_resume_token,
            new_expires_at,
        )
        .await?;

        if updated == 0 {
            // Raced with a concurrent resume of the same token; only one wins.
            return Err(GatewayError::ResumeFailed);
        }

        let cursors = db::list_cursors(&self.pool, &existing.device_id)
            .await?
            .into_iter()
            .map(CursorEntry::from)
            .collect();

        Ok(SessionReady {
            session_token: new_session_token,
            resume_token: new_resume_token,
            expires_at: new_expires_at,
            cursors,
            device_id: existing.device_id,
            user_id: existing.user_id,
        })
    }

    pub async fn authenticate(&self, session_token: &str) -> Result<AuthenticatedDevice, GatewayError> {
        let session = db::get_session_by_token(&self.pool, session_token)
            .await?
            .ok_or(GatewayError::Unauthorized)?;

        if !session.is_active(Utc::now()) {
            return Err(GatewayError::Unauthorized);
        }

        Ok(AuthenticatedDevice {
            device_id: session.device_id,
            user_id: session.user_id,
        })
    }

    pub async fn revoke_session(&self, session_token: &str) -> Result<(), GatewayError> {
        db::revoke_session(&self.pool, session_token).await?;
        Ok(())
    }

    pub async fn revoke_device(&self, device_id: &str) -> Result<(), GatewayError> {
        db::revoke_sessions_for_device(&self.pool, device_id).await?;
        Ok(())
    }

    pub async fn logout_all(&self, user_id: &str) -> Result<u64, GatewayError> {
        Ok(db::revoke_sessions_for_user(&self.pool, user_id).await?)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<crate::models::Session>, GatewayError> {
        Ok(db::list_sessions_for_user(&self.pool, user_id).await?)
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatedDevice {
    pub device_id: String,
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn manager() -> SessionManager {
        let pool = db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        SessionManager::new(pool, 3600, None)
    }

    #[tokio::test]
    async fn start_then_resume_rotates_resume_token() {
        let mgr = manager().await;
        let started = mgr
            .start("any-token", Some("dev1"), None)
            .await
            .unwrap();

        let resumed = mgr.resume(&started.resume_token).await.unwrap();
        assert_ne!(resumed.resume_token, started.resume_token);

        let replay = mgr.resume(&started.resume_token).await;
        assert!(replay.is_err(), "old resume token must not be reusable");
    }

    #[tokio::test]
    async fn revoked_session_fails_authentication() {
        let mgr = manager().await;
        let started = mgr
            .start("any-token", Some("dev1"), None)
            .await
            .unwrap();

        mgr.revoke_session(&started.session_token).await.unwrap();
        let auth = mgr.authenticate(&started.session_token).await;
        assert!(auth.is_err());
    }

    #[tokio::test]
    async fn dev_mode_derives_user_id_deterministically_from_the_token() {
        let mgr = manager().await;
        let a = mgr.start("token-a", Some("dev1"), None).await.unwrap();
        let b = mgr.start("token-a", Some("dev2"), None).await.unwrap();
        let c = mgr.start("token-b", Some("dev3"), None).await.unwrap();

        assert_eq!(a.user_id, b.user_id, "the same token must always derive the same identity");
        assert_ne!(a.user_id, c.user_id);
    }

    #[tokio::test]
    async fn shared_secret_mode_derives_user_id_from_the_token_and_rejects_bare_secrets() {
        let pool = db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        let mgr = SessionManager::new(pool, 3600, Some("issuer-secret".to_string()));

        let started = mgr
            .start("issuer-secret:alice", Some("dev1"), None)
            .await
            .unwrap();
        assert_eq!(started.user_id, "alice");

        // Holding only the bare secret, with no identity suffix, must not mint a session.
        let bare = mgr.start("issuer-secret", Some("dev2"), None).await;
        assert!(bare.is_err());

        // A token signed under a different secret must not be accepted either.
        let wrong_secret = mgr.start("not-the-secret:alice", Some("dev3"), None).await;
        assert!(wrong_secret.is_err());
    }
}
