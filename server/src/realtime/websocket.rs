//! Bidirectional `/v1/ws` socket: `session.start`/`session.resume` as the
//! first frame, then `conv.subscribe`/`conv.send`/`conv.ack`/ping-pong,
//! exactly the ancestor's multi-branch `tokio::select!` loop but redriven
//! off JSON `Frame`s, the conversation broker, and opaque session tokens
//! instead of DAG-CBOR frames, `SseState`, and ticket auth.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tokio_stream::{wrappers::BroadcastStream, StreamMap};
use tracing::{debug, info, warn};

use crate::broker::ConversationBroker;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::frame::{t, Frame, PROTOCOL_VERSION};
use crate::middleware::rate_limit::{extract_client_ip, OperationLimiter};
use crate::models::ConvEvent;
use crate::session::SessionManager;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(broker): State<ConversationBroker>,
    State(sessions): State<SessionManager>,
    State(config): State<GatewayConfig>,
    State(operation_limiter): State<std::sync::Arc<OperationLimiter>>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, sessions, config, operation_limiter, client_ip))
}

struct Identity {
    device_id: String,
    user_id: String,
}

async fn handle_socket(
    socket: WebSocket,
    broker: ConversationBroker,
    sessions: SessionManager,
    config: GatewayConfig,
    operation_limiter: Arc<OperationLimiter>,
    client_ip: String,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let mut identity: Option<Identity> = None;
    let mut subs: StreamMap<String, BroadcastStream<Arc<ConvEvent>>> = StreamMap::new();
    let mut high_water: HashMap<String, i64> = HashMap::new();

    let heartbeat_period = Duration::from_secs(config.heartbeat_interval_seconds.max(1));
    let mut heartbeat = interval(heartbeat_period);
    heartbeat.tick().await;
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else { break };
                match inbound {
                    Ok(Message::Text(text)) => {
                        if text.len() > config.frame_byte_cap {
                            send_error(&mut sender, None, GatewayError::InvalidRequest {
                                message: "frame exceeds frame_byte_cap".to_string(),
                            }).await;
                            continue;
                        }
                        if let Err(retry_after_s) = operation_limiter.check_frame_rate(&connection_id) {
                            send_error(&mut sender, None, GatewayError::RateLimited { retry_after_s }).await;
                            continue;
                        }
                        let frame = match Frame::from_json(&text) {
                            Ok(f) => f,
                            Err(_) => {
                                send_error(&mut sender, None, GatewayError::InvalidRequest {
                                    message: "malformed frame".to_string(),
                                }).await;
                                continue;
                            }
                        };
                        if frame.v != PROTOCOL_VERSION {
                            send_error(&mut sender, frame.id.clone(), GatewayError::UnsupportedVersion).await;
                            continue;
                        }

                        let id = frame.id.clone();
                        let was_authenticated = identity.is_some();
                        let outcome = dispatch(
                            frame, &mut identity, &mut subs, &mut high_water, &mut missed_pongs,
                            &broker, &sessions, &operation_limiter, &client_ip,
                        ).await;
                        match outcome {
                            Ok(replies) => {
                                for reply in replies {
                                    if sender.send(Message::Text(reply.to_json())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                send_error(&mut sender, id, err.clone()).await;
                                if !was_authenticated && identity.is_none() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(connection_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            Some((conv_id, item)) = subs.next() => {
                match item {
                    Ok(event) => {
                        let floor = high_water.get(&conv_id).copied().unwrap_or(0);
                        if event.seq <= floor {
                            continue;
                        }
                        high_water.insert(conv_id.clone(), event.seq);
                        let frame = Frame::new(t::CONV_EVENT, event.to_wire_json());
                        if sender.send(Message::Text(frame.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Err(_lagged) => {
                        warn!(connection_id, conv_id, "websocket subscriber lagged, some events may be delayed");
                    }
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= 2 {
                    info!(connection_id, "closing connection after missed heartbeats");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                missed_pongs += 1;
                let ping_id = uuid::Uuid::new_v4().to_string();
                let frame = Frame::new(t::PING, serde_json::json!({})).with_id(ping_id);
                if sender.send(Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(connection_id, "websocket connection closed");
}

/// Dispatches one inbound frame, returning zero or more reply frames in the
/// order they should be written (e.g. a `conv.subscribe` backlog replay
/// followed by nothing further until the live tail starts arriving).
async fn dispatch(
    frame: Frame,
    identity: &mut Option<Identity>,
    subs: &mut StreamMap<String, BroadcastStream<Arc<ConvEvent>>>,
    high_water: &mut HashMap<String, i64>,
    missed_pongs: &mut u32,
    broker: &ConversationBroker,
    sessions: &SessionManager,
    operation_limiter: &OperationLimiter,
    client_ip: &str,
) -> Result<Vec<Frame>, GatewayError> {
    match frame.t.as_str() {
        t::SESSION_START => {
            operation_limiter
                .check_unauthenticated_ip(client_ip)
                .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

            let body = frame.body;
            let auth_token = body["auth_token"].as_str().unwrap_or("");
            let device_id = body["device_id"].as_str();
            let device_credential = body["device_credential"].as_str();

            let ready = sessions.start(auth_token, device_id, device_credential).await?;
            *identity = Some(Identity {
                device_id: ready.device_id.clone(),
                user_id: ready.user_id.clone(),
            });
            Ok(vec![Frame::new(t::SESSION_READY, serde_json::to_value(&ready).unwrap())])
        }
        t::SESSION_RESUME => {
            let resume_token = frame.body["resume_token"]
                .as_str()
                .ok_or_else(|| GatewayError::InvalidRequest {
                    message: "resume_token is required".to_string(),
                })?;
            let ready = sessions.resume(resume_token).await?;
            *identity = Some(Identity {
                device_id: ready.device_id.clone(),
                user_id: ready.user_id.clone(),
            });
            Ok(vec![Frame::new(t::SESSION_READY, serde_json::to_value(&ready).unwrap())])
        }
        t::PONG => {
            *missed_pongs = 0;
            Ok(vec![])
        }
        t::PING => Ok(vec![Frame::new(t::PONG, serde_json::json!({}))]),
        other => {
            let identity = identity.as_ref().ok_or(GatewayError::Unauthorized)?;
            match other {
                t::CONV_SUBSCRIBE => {
                    let conv_id = frame.body["conv_id"]
                        .as_str()
                        .ok_or_else(|| GatewayError::InvalidRequest {
                            message: "conv_id is required".to_string(),
                        })?;
                    let from_seq = frame.body["from_seq"]
                        .as_i64()
                        .or_else(|| frame.body["after_seq"].as_i64().map(|s| s + 1));

                    let (backlog, rx) = broker.admit_subscribe(conv_id, &identity.device_id, from_seq).await?;
                    let floor = backlog
                        .last()
                        .map(|e| e.seq)
                        .unwrap_or_else(|| from_seq.unwrap_or(1) - 1);
                    high_water.insert(conv_id.to_string(), floor);
                    subs.insert(conv_id.to_string(), BroadcastStream::new(rx));

                    Ok(backlog
                        .into_iter()
                        .map(|event| Frame::new(t::CONV_EVENT, event.to_wire_json()))
                        .collect())
                }
                t::CONV_SEND => {
                    let conv_id = frame.body["conv_id"]
                        .as_str()
                        .ok_or_else(|| GatewayError::InvalidRequest {
                            message: "conv_id is required".to_string(),
                        })?;
                    let msg_id = frame.body["msg_id"]
                        .as_str()
                        .ok_or_else(|| GatewayError::InvalidRequest {
                            message: "msg_id is required".to_string(),
                        })?;
                    let env = frame.body["env"].as_str().ok_or_else(|| GatewayError::InvalidRequest {
                        message: "env is required".to_string(),
                    })?;

                    let outcome = broker
                        .admit_send(conv_id, &identity.device_id, &identity.user_id, msg_id, env)
                        .await?;

                    Ok(vec![Frame::new(
                        t::CONV_ACKED,
                        serde_json::json!({ "conv_id": conv_id, "msg_id": msg_id, "seq": outcome.event.seq }),
                    )])
                }
                t::CONV_ACK => {
                    let conv_id = frame.body["conv_id"]
                        .as_str()
                        .ok_or_else(|| GatewayError::InvalidRequest {
                            message: "conv_id is required".to_string(),
                        })?;
                    let seq = frame.body["seq"].as_i64().ok_or_else(|| GatewayError::InvalidRequest {
                        message: "seq is required".to_string(),
                    })?;
                    crate::db::ack_cursor(broker.pool(), &identity.device_id, conv_id, seq).await?;
                    Ok(vec![])
                }
                _ => Err(GatewayError::InvalidRequest {
                    message: format!("unrecognized frame type: {other}"),
                }),
            }
        }
    }
}

async fn send_error(sender: &mut SplitSink<WebSocket, Message>, id: Option<String>, err: GatewayError) {
    let mut frame = Frame::new(t::ERROR, err.to_frame_body());
    if let Some(id) = id {
        frame = frame.with_id(id);
    }
    let _ = sender.send(Message::Text(frame.to_json())).await;
}
