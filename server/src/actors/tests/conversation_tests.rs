#[cfg(test)]
mod conversation_tests {
    use std::time::Duration;

    use ractor::Actor;
    use tokio::sync::oneshot;

    use crate::actors::{ConversationActor, ConvoActorArgs, ConvoMessage};
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

    async fn spawn_actor(conv_id: &str, pool: db::DbPool) -> ractor::ActorRef<ConvoMessage> {
        db::ensure_conversation(&pool, conv_id, "gw_local", "group", None)
            .await
            .unwrap();

        let args = ConvoActorArgs {
            conv_id: conv_id.to_string(),
            db_pool: pool,
            origin_gateway: "gw_local".to_string(),
        };
        let (actor_ref, _handle) = Actor::spawn(None, ConversationActor, args)
            .await
            .expect("actor spawn");
        actor_ref
    }

    #[tokio::test]
    async fn send_allocates_increasing_seq() {
        let pool = memory_pool().await;
        let actor = spawn_actor("conv1", pool).await;

        let (tx1, rx1) = oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: "m1".into(),
                env: b"hello".to_vec(),
                reply: tx1,
            })
            .unwrap();
        let first = rx1.await.unwrap().unwrap();

        let (tx2, rx2) = oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: "m2".into(),
                env: b"world".to_vec(),
                reply: tx2,
            })
            .unwrap();
        let second = rx2.await.unwrap().unwrap();

        assert_eq!(first.event.seq, 1);
        assert_eq!(second.event.seq, 2);
        assert!(!first.duplicate && !second.duplicate);
    }

    #[tokio::test]
    async fn resending_same_msg_id_is_flagged_duplicate() {
        let pool = memory_pool().await;
        let actor = spawn_actor("conv1", pool).await;

        let (tx1, rx1) = oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: "m1".into(),
                env: b"hello".to_vec(),
                reply: tx1,
            })
            .unwrap();
        let first = rx1.await.unwrap().unwrap();

        let (tx2, rx2) = oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: "m1".into(),
                env: b"hello-again".to_vec(),
                reply: tx2,
            })
            .unwrap();
        let retry = rx2.await.unwrap().unwrap();

        assert_eq!(retry.event.seq, first.event.seq);
        assert!(retry.duplicate);
        assert_eq!(retry.event.env, first.event.env);
    }

    #[tokio::test]
    async fn subscribe_receives_events_sent_after_it() {
        let pool = memory_pool().await;
        let actor = spawn_actor("conv1", pool).await;

        let (sub_tx, sub_rx) = oneshot::channel();
        actor.cast(ConvoMessage::Subscribe { reply: sub_tx }).unwrap();
        let mut receiver = sub_rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: "m1".into(),
                env: b"hello".to_vec(),
                reply: tx,
            })
            .unwrap();
        rx.await.unwrap().unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.msg_id, "m1");
    }
}
