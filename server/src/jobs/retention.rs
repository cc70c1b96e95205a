//! Retention / GC sweeper: prunes `conv_events` by age and count per
//! `RetentionConfig`, honoring SAFE mode's promise to never prune an event a
//! lagging-but-active cursor still needs.

use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::RetentionConfig;
use crate::db::{self, DbPool};

pub async fn run_retention_worker(pool: DbPool, config: RetentionConfig) {
    let mut ticker = interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
    info!(
        sweep_interval_s = config.sweep_interval_seconds,
        hard_limits = config.hard_limits,
        "starting retention sweeper"
    );

    loop {
        ticker.tick().await;

        let conv_ids = match db::list_conv_ids(&pool).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "retention sweep failed to list conversations");
                continue;
            }
        };

        for conv_id in conv_ids {
            if let Err(e) = sweep_one(&pool, &conv_id, &config).await {
                error!(conv_id, error = %e, "retention sweep failed for conversation");
            }
        }
    }
}

async fn sweep_one(pool: &DbPool, conv_id: &str, config: &RetentionConfig) -> anyhow::Result<()> {
    let floor = if config.hard_limits {
        None
    } else {
        db::min_next_seq_over_active_cursors(pool, conv_id, config.cursor_stale_after_seconds)
            .await?
            .map(|next_seq| next_seq - 1)
    };

    if let Some(max_age) = config.max_age_seconds {
        let deleted = db::prune_events_by_age(pool, conv_id, max_age, floor).await?;
        if deleted > 0 {
            info!(conv_id, deleted, "pruned events by age");
        }
    }

    if let Some(max_events) = config.max_events_per_conv {
        let deleted = db::prune_events_by_count(pool, conv_id, max_events, floor).await?;
        if deleted > 0 {
            info!(conv_id, deleted, "pruned events by count");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    async fn pool() -> DbPool {
        db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: StdDuration::from_secs(5),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn safe_mode_never_prunes_behind_an_active_cursor() {
        let pool = pool().await;
        db::ensure_conversation(&pool, "conv1", "gw_local", "group", None)
            .await
            .unwrap();
        for i in 0..5 {
            db::allocate_and_insert(&pool, "conv1", &format!("m{i}"), b"x", "gw_local")
                .await
                .unwrap();
        }
        // A cursor still sitting at seq 1 protects everything from seq 1 onward.
        db::ack_cursor(&pool, "dev1", "conv1", 0).await.unwrap();

        let config = RetentionConfig {
            max_events_per_conv: Some(1),
            max_age_seconds: None,
            sweep_interval_seconds: 1,
            cursor_stale_after_seconds: 0,
            hard_limits: false,
        };
        sweep_one(&pool, "conv1", &config).await.unwrap();

        let remaining = db::replay_from(&pool, "conv1", 1).await.unwrap();
        assert_eq!(remaining.len(), 5, "SAFE mode must not prune events an active cursor still needs");
    }

    #[tokio::test]
    async fn hard_mode_enforces_count_cap_regardless_of_cursors() {
        let pool = pool().await;
        db::ensure_conversation(&pool, "conv1", "gw_local", "group", None)
            .await
            .unwrap();
        for i in 0..5 {
            db::allocate_and_insert(&pool, "conv1", &format!("m{i}"), b"x", "gw_local")
                .await
                .unwrap();
        }
        db::ack_cursor(&pool, "dev1", "conv1", 0).await.unwrap();

        let config = RetentionConfig {
            max_events_per_conv: Some(2),
            max_age_seconds: None,
            sweep_interval_seconds: 1,
            cursor_stale_after_seconds: 0,
            hard_limits: true,
        };
        sweep_one(&pool, "conv1", &config).await.unwrap();

        let remaining = db::replay_from(&pool, "conv1", 1).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
