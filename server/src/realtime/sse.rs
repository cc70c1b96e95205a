//! `GET /v1/sse` — server-push half of the gateway's transport pair. Mirrors
//! the socket's `conv.subscribe` semantics exactly: membership check, replay
//! from `from_seq` inclusive, then a live tail of the same broadcast channel
//! the conversation actor publishes to.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::auth::AuthUser;
use crate::broker::ConversationBroker;
use crate::error::GatewayError;
use crate::frame::{t, Frame};

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    conv_id: String,
    from_seq: Option<i64>,
    after_seq: Option<i64>,
}

pub async fn subscribe(
    State(broker): State<ConversationBroker>,
    auth_user: AuthUser,
    Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let conv_id = query.conv_id;

    // `from_seq` wins over the legacy `after_seq` hint when both are given.
    let from_seq = query.from_seq.or_else(|| query.after_seq.map(|s| s + 1));

    let (backlog, rx) = broker
        .admit_subscribe(&conv_id, &auth_user.device_id, from_seq)
        .await?;

    // Same overlap the socket transport guards against: the receiver is
    // registered before the backlog query runs, so an event landing in
    // that window appears in both. Track the floor and skip live repeats.
    let floor = backlog.last().map(|e| e.seq).unwrap_or(from_seq.unwrap_or(1) - 1);

    let stream = stream::iter(backlog.into_iter().map(|event| {
        Ok::<Event, Infallible>(Event::default().data(Frame::new(t::CONV_EVENT, event.to_wire_json()).to_json()))
    }))
    .chain(live_tail(rx, conv_id, floor));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn live_tail(
    rx: broadcast::Receiver<std::sync::Arc<crate::models::ConvEvent>>,
    conv_id: String,
    floor: i64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, conv_id, floor), move |(mut rx, conv_id, mut floor)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.seq <= floor {
                        continue;
                    }
                    floor = event.seq;
                    let frame = Frame::new(t::CONV_EVENT, event.to_wire_json());
                    return Some((Ok(Event::default().data(frame.to_json())), (rx, conv_id, floor)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(conv_id = %conv_id, skipped, "sse consumer lagged, resubscribe recommended");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
