#[cfg(test)]
mod registry_tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::actors::{ActorRegistry, ConvoMessage};
    use crate::db::{self, DbConfig};

    async fn memory_pool() -> db::DbPool {
        db::init_db(&DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .expect("memory pool")
    }

    #[tokio::test]
    async fn get_or_spawn_reuses_existing_actor() {
        let pool = memory_pool().await;
        db::ensure_conversation(&pool, "conv1", "gw_local", "group", None)
            .await
            .unwrap();

        let registry = ActorRegistry::new(pool, "gw_local".to_string());

        let a = registry.get_or_spawn("conv1").await.unwrap();
        let b = registry.get_or_spawn("conv1").await.unwrap();

        assert_eq!(registry.actor_count(), 1);
        assert!(a.get_id() == b.get_id());
    }

    #[tokio::test]
    async fn distinct_conversations_get_distinct_actors() {
        let pool = memory_pool().await;
        db::ensure_conversation(&pool, "conv1", "gw_local", "group", None)
            .await
            .unwrap();
        db::ensure_conversation(&pool, "conv2", "gw_local", "group", None)
            .await
            .unwrap();

        let registry = ActorRegistry::new(pool, "gw_local".to_string());
        registry.get_or_spawn("conv1").await.unwrap();
        registry.get_or_spawn("conv2").await.unwrap();

        assert_eq!(registry.actor_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_all_clears_the_registry() {
        let pool = memory_pool().await;
        db::ensure_conversation(&pool, "conv1", "gw_local", "group", None)
            .await
            .unwrap();

        let registry = ActorRegistry::new(pool, "gw_local".to_string());
        registry.get_or_spawn("conv1").await.unwrap();

        registry.shutdown_all().await;
        assert_eq!(registry.actor_count(), 0);

        // A fresh get_or_spawn after shutdown must produce a usable actor,
        // not resurrect a reference to the stopped one.
        let revived = registry.get_or_spawn("conv1").await.unwrap();
        let (tx, rx) = oneshot::channel();
        revived
            .cast(ConvoMessage::Send {
                msg_id: "m1".into(),
                env: b"hello".to_vec(),
                reply: tx,
            })
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }
}
