//! Row types for the gateway's persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub device_credential: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Conversation {
    pub conv_id: String,
    pub conv_home: String,
    pub kind: String,
    pub owner_device_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ConvMember {
    pub conv_id: String,
    pub device_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ConvEvent {
    pub conv_id: String,
    pub seq: i64,
    pub msg_id: String,
    pub env: Vec<u8>,
    pub ts_ms: i64,
    pub origin_gateway: String,
}

impl ConvEvent {
    /// Wire representation of a `conv.event` body: `env` travels as base64,
    /// never as a raw byte array, matching the frame envelope's JSON body.
    pub fn to_wire_json(&self) -> serde_json::Value {
        use base64::Engine;
        serde_json::json!({
            "conv_id": self.conv_id,
            "seq": self.seq,
            "msg_id": self.msg_id,
            "env": base64::engine::general_purpose::STANDARD.encode(&self.env),
            "ts_ms": self.ts_ms,
            "origin_gateway": self.origin_gateway,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Cursor {
    pub device_id: String,
    pub conv_id: String,
    pub next_seq: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Session {
    pub session_token: String,
    pub resume_token: String,
    pub device_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct KeyPackage {
    pub id: i64,
    pub device_id: String,
    pub user_id: String,
    pub blob: Vec<u8>,
    pub content_hash: String,
    pub served: bool,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl KeyPackage {
    pub fn is_available(&self) -> bool {
        !self.served && !self.revoked
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PresenceLease {
    pub device_id: String,
    pub user_id: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub invisible: bool,
}

impl PresenceLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct WatchEdge {
    pub watcher_user_id: String,
    pub target_user_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct BlockEdge {
    pub user_id: String,
    pub blocked_user_id: String,
}
