//! Background worker for key package cleanup: removes served packages past
//! their retention window and anything already revoked.

use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::db::DbPool;

const SERVED_RETENTION_SECONDS: i64 = 86_400; // 24 hours

pub async fn run_key_package_cleanup_worker(pool: DbPool, sweep_interval: Duration) {
    let mut ticker = interval(sweep_interval);
    info!(interval_s = sweep_interval.as_secs(), "starting key package cleanup worker");

    loop {
        ticker.tick().await;

        match crate::db::delete_served_keypackages_older_than(&pool, SERVED_RETENTION_SECONDS).await {
            Ok(count) if count > 0 => info!(count, "cleaned up served key packages"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "served key package cleanup failed"),
        }

        match crate::db::delete_revoked_keypackages(&pool).await {
            Ok(count) if count > 0 => info!(count, "cleaned up revoked key packages"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "revoked key package cleanup failed"),
        }
    }
}
