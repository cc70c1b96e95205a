//! `POST /v1/inbox` — the write half of the SSE/inbox transport pair. Only
//! the frame types that make sense without a persistent connection are
//! accepted; `conv.subscribe` belongs to `GET /v1/sse`.

use axum::{extract::State, response::IntoResponse, Json};

use crate::auth::AuthUser;
use crate::broker::ConversationBroker;
use crate::error::GatewayError;
use crate::frame::{t, Frame};

pub async fn inbox(
    State(broker): State<ConversationBroker>,
    auth_user: AuthUser,
    Json(frame): Json<Frame>,
) -> Result<impl IntoResponse, GatewayError> {
    match frame.t.as_str() {
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
                .admit_send(conv_id, &auth_user.device_id, &auth_user.user_id, msg_id, env)
                .await?;

            Ok(Json(Frame::new(
                t::CONV_ACKED,
                serde_json::json!({ "conv_id": conv_id, "msg_id": msg_id, "seq": outcome.event.seq }),
            )))
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
            crate::db::ack_cursor(broker.pool(), &auth_user.device_id, conv_id, seq).await?;
            Ok(Json(Frame::new(t::PONG, serde_json::json!({}))))
        }
        t::PING => Ok(Json(Frame::new(t::PONG, serde_json::json!({})))),
        other => Err(GatewayError::InvalidRequest {
            message: format!("unsupported frame type for inbox: {other}"),
        }),
    }
}
