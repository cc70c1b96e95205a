//! Key package directory: publish, fetch, and rotate, with routing metadata
//! describing which gateway actually served a fetch.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::GatewayConfig;
use crate::db::{self, DbPool};
use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize)]
pub struct FetchedKeyPackage {
    pub blob: Vec<u8>,
    pub content_hash: String,
    pub served_by: String,
    pub user_home_gateway: String,
}

#[derive(Clone)]
pub struct KeyPackageService {
    pool: DbPool,
    gateway_id: String,
    max_per_device: i64,
}

impl KeyPackageService {
    pub fn new(pool: DbPool, config: &GatewayConfig) -> Self {
        Self {
            pool,
            gateway_id: config.gateway_id.clone(),
            max_per_device: config.max_keypackages_per_device,
        }
    }

    pub async fn publish(&self, device_id: &str, user_id: &str, blob: &[u8]) -> Result<(), GatewayError> {
        let available = db::count_available_keypackages(&self.pool, device_id).await?;
        if available >= self.max_per_device {
            return Err(GatewayError::InvalidRequest {
                message: format!("device already has {available} available key packages"),
            });
        }

        let content_hash = hex::encode(Sha256::digest(blob));
        db::publish_keypackage(&self.pool, device_id, user_id, blob, &content_hash).await?;
        db::enforce_keypackage_pool_cap(&self.pool, device_id, self.max_per_device).await?;
        Ok(())
    }

    /// Claims one key package for `user_id`. `served_by` is always this
    /// gateway's own id; there is no cross-gateway federation in this
    /// deployment, so `user_home_gateway` mirrors it.
    pub async fn fetch(&self, user_id: &str) -> Result<FetchedKeyPackage, GatewayError> {
        let package = db::fetch_one_keypackage(&self.pool, user_id)
            .await?
            .ok_or(GatewayError::NotFound)?;

        Ok(FetchedKeyPackage {
            blob: package.blob,
            content_hash: package.content_hash,
            served_by: self.gateway_id.clone(),
            user_home_gateway: self.gateway_id.clone(),
        })
    }

    /// Revokes the device's unserved packages (if `revoke_existing`) and
    /// atomically stores `replacements` in their place, enforcing the same
    /// per-device pool cap a plain `publish` would.
    pub async fn rotate(
        &self,
        device_id: &str,
        user_id: &str,
        revoke_existing: bool,
        replacements: &[Vec<u8>],
    ) -> Result<(), GatewayError> {
        if revoke_existing && (replacements.len() as i64) > self.max_per_device {
            return Err(GatewayError::InvalidRequest {
                message: format!("at most {} replacement key packages are allowed", self.max_per_device),
            });
        }

        let hashed: Vec<(Vec<u8>, String)> = replacements
            .iter()
            .map(|blob| (blob.clone(), hex::encode(Sha256::digest(blob))))
            .collect();

        db::rotate_keypackages(&self.pool, device_id, user_id, revoke_existing, &hashed).await?;
        db::enforce_keypackage_pool_cap(&self.pool, device_id, self.max_per_device).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn service() -> KeyPackageService {
        let pool = db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        let config = GatewayConfig {
            gateway_id: "gw_test".to_string(),
            max_keypackages_per_device: 2,
            ..GatewayConfig::from_env()
        };
        KeyPackageService::new(pool, &config)
    }

    #[tokio::test]
    async fn publish_enforces_per_device_cap() {
        let svc = service().await;
        svc.publish("dev1", "user1", b"kp-a").await.unwrap();
        svc.publish("dev1", "user1", b"kp-b").await.unwrap();
        let err = svc.publish("dev1", "user1", b"kp-c").await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn fetch_consumes_a_package_and_tags_routing_metadata() {
        let svc = service().await;
        svc.publish("dev1", "user1", b"kp-a").await.unwrap();

        let fetched = svc.fetch("user1").await.unwrap();
        assert_eq!(fetched.blob, b"kp-a");
        assert_eq!(fetched.served_by, "gw_test");
        assert_eq!(fetched.user_home_gateway, "gw_test");

        let err = svc.fetch("user1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn rotate_revokes_unserved_packages() {
        let svc = service().await;
        svc.publish("dev1", "user1", b"kp-a").await.unwrap();
        svc.rotate("dev1", "user1", true, &[]).await.unwrap();
        let err = svc.fetch("user1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn rotate_stores_replacements_atomically_with_the_revoke() {
        let svc = service().await;
        svc.publish("dev1", "user1", b"kp-old").await.unwrap();

        svc.rotate("dev1", "user1", true, &[b"kp-new".to_vec()]).await.unwrap();

        let fetched = svc.fetch("user1").await.unwrap();
        assert_eq!(fetched.blob, b"kp-new", "the old blob must be revoked and the new one served");
        let err = svc.fetch("user1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
