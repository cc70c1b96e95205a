//! Background worker that deletes presence leases past their `expires_at`.
//! Leases are short-lived (15-300s) so this runs frequently.

use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::db::{self, DbPool};

pub async fn run_presence_cleanup_worker(pool: DbPool) {
    let mut ticker = interval(Duration::from_secs(30));
    info!("starting presence lease cleanup worker");

    loop {
        ticker.tick().await;
        match db::delete_expired_presence_leases(&pool).await {
            Ok(count) if count > 0 => info!(count, "cleaned up expired presence leases"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "presence lease cleanup failed"),
        }
    }
}
