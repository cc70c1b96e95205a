//! Storage engine: schema, pool setup, and the transactional operations that
//! back the session manager, conversation broker, keypackage directory, and
//! presence service.
//!
//! Backed by SQLite (`sqlx::SqlitePool`). `DB_PATH` selects durable,
//! file-backed mode; when unset the gateway runs against an in-memory
//! database, which is also what the test suite uses.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{
    ConvEvent, ConvMember, Conversation, Cursor, Device, KeyPackage, PresenceLease, Session,
    WatchEdge,
};

pub type DbPool = SqlitePool;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub db_path: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::var("DB_PATH").ok(),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Initialize the connection pool and run the schema migration. Durable mode
/// (a `db_path`) enables WAL, synchronous normal, foreign keys on, and a
/// busy timeout of at least 5 seconds, matching the configuration surface's
/// durability knobs.
pub async fn init_db(config: &DbConfig) -> anyhow::Result<DbPool> {
    let connect_options = match &config.db_path {
        Some(path) => SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .context("invalid db_path")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5)),
        None => SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory sqlite url")?
            .foreign_keys(true),
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to sqlite")?;

    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn init_db_default() -> anyhow::Result<DbPool> {
    init_db(&DbConfig::default()).await
}

async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            device_credential TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS conversations (
            conv_id TEXT PRIMARY KEY,
            conv_home TEXT NOT NULL,
            kind TEXT NOT NULL,
            owner_device_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS conv_members (
            conv_id TEXT NOT NULL REFERENCES conversations(conv_id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conv_id, device_id)
        );

        CREATE TABLE IF NOT EXISTS conv_seq (
            conv_id TEXT PRIMARY KEY REFERENCES conversations(conv_id) ON DELETE CASCADE,
            next_seq INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS conv_events (
            conv_id TEXT NOT NULL REFERENCES conversations(conv_id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            msg_id TEXT NOT NULL,
            env BLOB NOT NULL,
            ts_ms INTEGER NOT NULL,
            origin_gateway TEXT NOT NULL,
            PRIMARY KEY (conv_id, seq),
            UNIQUE (conv_id, msg_id)
        );

        CREATE TABLE IF NOT EXISTS cursors (
            device_id TEXT NOT NULL,
            conv_id TEXT NOT NULL,
            next_seq INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (device_id, conv_id)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            session_token TEXT PRIMARY KEY,
            resume_token TEXT NOT NULL UNIQUE,
            device_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            revoked_at TEXT
        );

        CREATE TABLE IF NOT EXISTS keypackages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            blob BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            served INTEGER NOT NULL DEFAULT 0,
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (device_id, content_hash)
        );

        CREATE TABLE IF NOT EXISTS presence_leases (
            device_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            invisible INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS watchlists (
            watcher_user_id TEXT NOT NULL,
            target_user_id TEXT NOT NULL,
            PRIMARY KEY (watcher_user_id, target_user_id)
        );

        CREATE TABLE IF NOT EXISTS blocklists (
            user_id TEXT NOT NULL,
            blocked_user_id TEXT NOT NULL,
            PRIMARY KEY (user_id, blocked_user_id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to run schema migration")?;

    Ok(())
}

// ---------------------------------------------------------------------
// Conversations / membership
// ---------------------------------------------------------------------

pub async fn ensure_conversation(
    pool: &DbPool,
    conv_id: &str,
    conv_home: &str,
    kind: &str,
    owner_device_id: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO conversations (conv_id, conv_home, kind, owner_device_id) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (conv_id) DO NOTHING",
    )
    .bind(conv_id)
    .bind(conv_home)
    .bind(kind)
    .bind(owner_device_id)
    .execute(pool)
    .await
    .context("failed to ensure conversation")?;

    sqlx::query("INSERT INTO conv_seq (conv_id, next_seq) VALUES ($1, 1) ON CONFLICT (conv_id) DO NOTHING")
        .bind(conv_id)
        .execute(pool)
        .await
        .context("failed to ensure conv_seq row")?;

    Ok(())
}

pub async fn get_conversation(pool: &DbPool, conv_id: &str) -> anyhow::Result<Option<Conversation>> {
    let row = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE conv_id = $1")
        .bind(conv_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch conversation")?;
    Ok(row)
}

pub async fn add_member(pool: &DbPool, conv_id: &str, device_id: &str, is_admin: bool) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO conv_members (conv_id, device_id, is_admin) VALUES ($1, $2, $3) \
         ON CONFLICT (conv_id, device_id) DO UPDATE SET is_admin = excluded.is_admin",
    )
    .bind(conv_id)
    .bind(device_id)
    .bind(is_admin)
    .execute(pool)
    .await
    .context("failed to add member")?;
    Ok(())
}

pub async fn remove_member(pool: &DbPool, conv_id: &str, device_id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM conv_members WHERE conv_id = $1 AND device_id = $2")
        .bind(conv_id)
        .bind(device_id)
        .execute(pool)
        .await
        .context("failed to remove member")?;
    Ok(())
}

pub async fn is_member(pool: &DbPool, conv_id: &str, device_id: &str) -> anyhow::Result<bool> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM conv_members WHERE conv_id = $1 AND device_id = $2",
    )
    .bind(conv_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await
    .context("failed to check membership")?;
    Ok(exists.is_some())
}

pub async fn list_members(pool: &DbPool, conv_id: &str) -> anyhow::Result<Vec<ConvMember>> {
    let rows = sqlx::query_as::<_, ConvMember>("SELECT * FROM conv_members WHERE conv_id = $1")
        .bind(conv_id)
        .fetch_all(pool)
        .await
        .context("failed to list members")?;
    Ok(rows)
}

// ---------------------------------------------------------------------
// Events: atomic allocate-and-insert, replay, retention bounds
// ---------------------------------------------------------------------

pub enum SendOutcome {
    Inserted(ConvEvent),
    Duplicate(ConvEvent),
}

/// The core storage guarantee: a send either allocates the next `seq` and
/// inserts a brand new event, or observes an existing `(conv_id, msg_id)`
/// row and returns it unchanged. Both outcomes happen inside one
/// transaction so a concurrent sender never races the sequence counter.
pub async fn allocate_and_insert(
    pool: &DbPool,
    conv_id: &str,
    msg_id: &str,
    env: &[u8],
    origin_gateway: &str,
) -> anyhow::Result<SendOutcome> {
    let mut tx = pool.begin().await.context("failed to begin tx")?;

    if let Some(existing) = sqlx::query_as::<_, ConvEvent>(
        "SELECT * FROM conv_events WHERE conv_id = $1 AND msg_id = $2",
    )
    .bind(conv_id)
    .bind(msg_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to check idempotency index")?
    {
        tx.commit().await.context("failed to commit idempotent read")?;
        return Ok(SendOutcome::Duplicate(existing));
    }

    sqlx::query("INSERT INTO conv_seq (conv_id, next_seq) VALUES ($1, 1) ON CONFLICT (conv_id) DO NOTHING")
        .bind(conv_id)
        .execute(&mut *tx)
        .await
        .context("failed to ensure conv_seq row")?;

    let seq: i64 = sqlx::query_scalar("SELECT next_seq FROM conv_seq WHERE conv_id = $1")
        .bind(conv_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to read next_seq")?;

    let ts_ms = Utc::now().timestamp_millis();

    sqlx::query(
        "INSERT INTO conv_events (conv_id, seq, msg_id, env, ts_ms, origin_gateway) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(conv_id)
    .bind(seq)
    .bind(msg_id)
    .bind(env)
    .bind(ts_ms)
    .bind(origin_gateway)
    .execute(&mut *tx)
    .await
    .context("failed to insert event")?;

    sqlx::query("UPDATE conv_seq SET next_seq = next_seq + 1 WHERE conv_id = $1")
        .bind(conv_id)
        .execute(&mut *tx)
        .await
        .context("failed to advance next_seq")?;

    tx.commit().await.context("failed to commit send")?;

    Ok(SendOutcome::Inserted(ConvEvent {
        conv_id: conv_id.to_string(),
        seq,
        msg_id: msg_id.to_string(),
        env: env.to_vec(),
        ts_ms,
        origin_gateway: origin_gateway.to_string(),
    }))
}

pub async fn replay_from(pool: &DbPool, conv_id: &str, from_seq: i64) -> anyhow::Result<Vec<ConvEvent>> {
    let rows = sqlx::query_as::<_, ConvEvent>(
        "SELECT * FROM conv_events WHERE conv_id = $1 AND seq >= $2 ORDER BY seq ASC",
    )
    .bind(conv_id)
    .bind(from_seq)
    .fetch_all(pool)
    .await
    .context("failed to replay events")?;
    Ok(rows)
}

pub async fn list_conv_ids(pool: &DbPool) -> anyhow::Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT conv_id FROM conversations")
        .fetch_all(pool)
        .await
        .context("failed to list conversation ids")?;
    Ok(rows)
}

/// The lowest `next_seq` among cursors the retention sweeper considers
/// active: all cursors when `stale_after_seconds` is 0, otherwise only those
/// updated within that window. `None` means no cursor exists to protect.
pub async fn min_next_seq_over_active_cursors(
    pool: &DbPool,
    conv_id: &str,
    stale_after_seconds: u64,
) -> anyhow::Result<Option<i64>> {
    let seq: Option<i64> = if stale_after_seconds == 0 {
        sqlx::query_scalar("SELECT MIN(next_seq) FROM cursors WHERE conv_id = $1")
            .bind(conv_id)
            .fetch_one(pool)
            .await
            .context("failed to read min active cursor seq")?
    } else {
        sqlx::query_scalar(
            "SELECT MIN(next_seq) FROM cursors \
             WHERE conv_id = $1 AND updated_at >= datetime('now', '-' || $2 || ' seconds')",
        )
        .bind(conv_id)
        .bind(stale_after_seconds as i64)
        .fetch_one(pool)
        .await
        .context("failed to read min active cursor seq")?
    };
    Ok(seq)
}

/// Deletes events older than `max_age_seconds`, never touching `seq >= floor`
/// when a floor is given (SAFE mode).
pub async fn prune_events_by_age(
    pool: &DbPool,
    conv_id: &str,
    max_age_seconds: u64,
    floor: Option<i64>,
) -> anyhow::Result<u64> {
    let cutoff_ms = Utc::now().timestamp_millis() - (max_age_seconds as i64) * 1000;
    let result = sqlx::query(
        "DELETE FROM conv_events WHERE conv_id = $1 AND ts_ms < $2 AND seq < COALESCE($3, 9223372036854775807)",
    )
    .bind(conv_id)
    .bind(cutoff_ms)
    .bind(floor)
    .execute(pool)
    .await
    .context("failed to prune events by age")?;
    Ok(result.rows_affected())
}

/// Deletes the oldest events past `max_events`, never touching `seq >= floor`
/// when a floor is given (SAFE mode).
pub async fn prune_events_by_count(
    pool: &DbPool,
    conv_id: &str,
    max_events: u64,
    floor: Option<i64>,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM conv_events WHERE conv_id = $1 AND seq < COALESCE($3, 9223372036854775807) AND seq IN ( \
             SELECT seq FROM conv_events WHERE conv_id = $1 \
             ORDER BY seq DESC LIMIT -1 OFFSET $2 \
         )",
    )
    .bind(conv_id)
    .bind(max_events as i64)
    .bind(floor)
    .execute(pool)
    .await
    .context("failed to prune events by count")?;
    Ok(result.rows_affected())
}

pub async fn earliest_retained_seq(pool: &DbPool, conv_id: &str) -> anyhow::Result<Option<i64>> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT MIN(seq) FROM conv_events WHERE conv_id = $1")
        .bind(conv_id)
        .fetch_one(pool)
        .await
        .context("failed to read earliest retained seq")?;
    Ok(seq)
}

pub async fn latest_seq(pool: &DbPool, conv_id: &str) -> anyhow::Result<i64> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM conv_events WHERE conv_id = $1")
        .bind(conv_id)
        .fetch_one(pool)
        .await
        .context("failed to read latest seq")?;
    Ok(seq.unwrap_or(0))
}

// ---------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------

pub async fn get_cursor(pool: &DbPool, device_id: &str, conv_id: &str) -> anyhow::Result<Option<Cursor>> {
    let row = sqlx::query_as::<_, Cursor>(
        "SELECT * FROM cursors WHERE device_id = $1 AND conv_id = $2",
    )
    .bind(device_id)
    .bind(conv_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch cursor")?;
    Ok(row)
}

pub async fn list_cursors(pool: &DbPool, device_id: &str) -> anyhow::Result<Vec<Cursor>> {
    let rows = sqlx::query_as::<_, Cursor>("SELECT * FROM cursors WHERE device_id = $1")
        .bind(device_id)
        .fetch_all(pool)
        .await
        .context("failed to list cursors")?;
    Ok(rows)
}

/// Monotonic ack: never regresses a stored cursor.
pub async fn ack_cursor(pool: &DbPool, device_id: &str, conv_id: &str, seq: i64) -> anyhow::Result<()> {
    let next_seq = seq + 1;
    sqlx::query(
        "INSERT INTO cursors (device_id, conv_id, next_seq, updated_at) \
         VALUES ($1, $2, $3, datetime('now')) \
         ON CONFLICT (device_id, conv_id) DO UPDATE SET \
           next_seq = MAX(cursors.next_seq, excluded.next_seq), \
           updated_at = excluded.updated_at",
    )
    .bind(device_id)
    .bind(conv_id)
    .bind(next_seq)
    .execute(pool)
    .await
    .context("failed to ack cursor")?;
    Ok(())
}

// ---------------------------------------------------------------------
// Devices / sessions
// ---------------------------------------------------------------------

pub async fn ensure_device(
    pool: &DbPool,
    device_id: &str,
    user_id: &str,
    device_credential: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO devices (device_id, user_id, device_credential) VALUES ($1, $2, $3) \
         ON CONFLICT (device_id) DO NOTHING",
    )
    .bind(device_id)
    .bind(user_id)
    .bind(device_credential)
    .execute(pool)
    .await
    .context("failed to ensure device")?;
    Ok(())
}

pub async fn get_device(pool: &DbPool, device_id: &str) -> anyhow::Result<Option<Device>> {
    let row = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = $1")
        .bind(device_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch device")?;
    Ok(row)
}

pub async fn insert_session(
    pool: &DbPool,
    session_token: &str,
    resume_token: &str,
    device_id: &str,
    user_id: &str,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO sessions (session_token, resume_token, device_id, user_id, expires_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(session_token)
    .bind(resume_token)
    .bind(device_id)
    .bind(user_id)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("failed to insert session")?;
    Ok(())
}

pub async fn get_session_by_token(pool: &DbPool, session_token: &str) -> anyhow::Result<Option<Session>> {
    let row = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_token = $1")
        .bind(session_token)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session")?;
    Ok(row)
}

pub async fn get_session_by_resume_token(
    pool: &DbPool,
    resume_token: &str,
) -> anyhow::Result<Option<Session>> {
    let row = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE resume_token = $1")
        .bind(resume_token)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session by resume token")?;
    Ok(row)
}

/// Rotates a session's tokens in place, implementing single-use resume
/// tokens: the old resume token can never be replayed after this commits.
pub async fn rotate_session(
    pool: &DbPool,
    old_resume_token: &str,
    new_session_token: &str,
    new_resume_token: &str,
    new_expires_at: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions SET session_token = $2, resume_token = $3, expires_at = $4 \
         WHERE resume_token = $1 AND revoked_at IS NULL",
    )
    .bind(old_resume_token)
    .bind(new_session_token)
    .bind(new_resume_token)
    .bind(new_expires_at)
    .execute(pool)
    .await
    .context("failed to rotate session")?;
    Ok(result.rows_affected())
}

pub async fn revoke_session(pool: &DbPool, session_token: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE sessions SET revoked_at = datetime('now') WHERE session_token = $1")
        .bind(session_token)
        .execute(pool)
        .await
        .context("failed to revoke session")?;
    Ok(())
}

pub async fn revoke_sessions_for_device(pool: &DbPool, device_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE sessions SET revoked_at = datetime('now') WHERE device_id = $1 AND revoked_at IS NULL",
    )
    .bind(device_id)
    .execute(pool)
    .await
    .context("failed to revoke device sessions")?;
    Ok(())
}

pub async fn revoke_sessions_for_user(pool: &DbPool, user_id: &str) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "UPDATE sessions SET revoked_at = datetime('now') WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(user_id)
    .execute(pool)
    .await
    .context("failed to revoke user sessions")?;
    Ok(result.rows_affected())
}

pub async fn list_sessions_for_user(pool: &DbPool, user_id: &str) -> anyhow::Result<Vec<Session>> {
    let rows = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE user_id = $1 AND revoked_at IS NULL ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list sessions")?;
    Ok(rows)
}

// ---------------------------------------------------------------------
// KeyPackages
// ---------------------------------------------------------------------

pub async fn publish_keypackage(
    pool: &DbPool,
    device_id: &str,
    user_id: &str,
    blob: &[u8],
    content_hash: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO keypackages (device_id, user_id, blob, content_hash) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (device_id, content_hash) DO NOTHING",
    )
    .bind(device_id)
    .bind(user_id)
    .bind(blob)
    .bind(content_hash)
    .execute(pool)
    .await
    .context("failed to publish key package")?;
    Ok(())
}

pub async fn count_available_keypackages(pool: &DbPool, device_id: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM keypackages WHERE device_id = $1 AND served = 0 AND revoked = 0",
    )
    .bind(device_id)
    .fetch_one(pool)
    .await
    .context("failed to count key packages")?;
    Ok(count)
}

/// Atomically claims and consumes one available key package for `user_id`.
/// SQLite has no `FOR UPDATE SKIP LOCKED`; a single `UPDATE ... WHERE id = (subquery) RETURNING`
/// is safe here because SQLite's writer lock already serializes all writers,
/// which is the equivalent safety property the ancestor CTE relied on `FOR
/// UPDATE SKIP LOCKED` to provide against concurrent Postgres writers.
pub async fn fetch_one_keypackage(pool: &DbPool, user_id: &str) -> anyhow::Result<Option<KeyPackage>> {
    let row = sqlx::query_as::<_, KeyPackage>(
        "UPDATE keypackages SET served = 1 \
         WHERE id = ( \
             SELECT id FROM keypackages \
             WHERE user_id = $1 AND served = 0 AND revoked = 0 \
             ORDER BY created_at ASC LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch key package")?;
    Ok(row)
}

/// Revokes the device's unserved packages and stores replacements in one
/// transaction, so a client never observes a window where the old pool is
/// gone but the new one isn't published yet.
pub async fn rotate_keypackages(
    pool: &DbPool,
    device_id: &str,
    user_id: &str,
    revoke_existing: bool,
    replacements: &[(Vec<u8>, String)],
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await.context("failed to begin rotate tx")?;

    if revoke_existing {
        sqlx::query("UPDATE keypackages SET revoked = 1 WHERE device_id = $1 AND served = 0")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .context("failed to revoke key packages")?;
    }

    for (blob, content_hash) in replacements {
        sqlx::query(
            "INSERT INTO keypackages (device_id, user_id, blob, content_hash) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (device_id, content_hash) DO NOTHING",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(blob)
        .bind(content_hash)
        .execute(&mut *tx)
        .await
        .context("failed to store replacement key package")?;
    }

    tx.commit().await.context("failed to commit rotate tx")?;
    Ok(())
}

pub async fn enforce_keypackage_pool_cap(pool: &DbPool, device_id: &str, cap: i64) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM keypackages WHERE id IN ( \
             SELECT id FROM keypackages \
             WHERE device_id = $1 AND served = 0 AND revoked = 0 \
             ORDER BY created_at ASC \
             LIMIT MAX(0, (SELECT COUNT(*) FROM keypackages WHERE device_id = $1 AND served = 0 AND revoked = 0) - $2) \
         )",
    )
    .bind(device_id)
    .bind(cap)
    .execute(pool)
    .await
    .context("failed to enforce key package pool cap")?;
    Ok(result.rows_affected())
}

pub async fn delete_served_keypackages_older_than(pool: &DbPool, seconds: i64) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM keypackages WHERE served = 1 AND created_at < datetime('now', '-' || $1 || ' seconds')",
    )
    .bind(seconds)
    .execute(pool)
    .await
    .context("failed to delete served key packages")?;
    Ok(result.rows_affected())
}

pub async fn delete_revoked_keypackages(pool: &DbPool) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM keypackages WHERE revoked = 1")
        .execute(pool)
        .await
        .context("failed to delete revoked key packages")?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------
// Presence / watchlists / blocklists
// ---------------------------------------------------------------------

pub async fn upsert_presence_lease(
    pool: &DbPool,
    device_id: &str,
    user_id: &str,
    status: &str,
    expires_at: DateTime<Utc>,
    invisible: bool,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO presence_leases (device_id, user_id, status, expires_at, invisible) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (device_id) DO UPDATE SET \
           status = excluded.status, expires_at = excluded.expires_at, invisible = excluded.invisible",
    )
    .bind(device_id)
    .bind(user_id)
    .bind(status)
    .bind(expires_at)
    .bind(invisible)
    .execute(pool)
    .await
    .context("failed to upsert presence lease")?;
    Ok(())
}

pub async fn get_presence_lease(pool: &DbPool, device_id: &str) -> anyhow::Result<Option<PresenceLease>> {
    let row = sqlx::query_as::<_, PresenceLease>("SELECT * FROM presence_leases WHERE device_id = $1")
        .bind(device_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch presence lease")?;
    Ok(row)
}

pub async fn delete_expired_presence_leases(pool: &DbPool) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM presence_leases WHERE expires_at <= datetime('now')")
        .execute(pool)
        .await
        .context("failed to delete expired presence leases")?;
    Ok(result.rows_affected())
}

pub async fn add_watch(pool: &DbPool, watcher_user_id: &str, target_user_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO watchlists (watcher_user_id, target_user_id) VALUES ($1, $2) \
         ON CONFLICT (watcher_user_id, target_user_id) DO NOTHING",
    )
    .bind(watcher_user_id)
    .bind(target_user_id)
    .execute(pool)
    .await
    .context("failed to add watch")?;
    Ok(())
}

pub async fn remove_watch(pool: &DbPool, watcher_user_id: &str, target_user_id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM watchlists WHERE watcher_user_id = $1 AND target_user_id = $2")
        .bind(watcher_user_id)
        .bind(target_user_id)
        .execute(pool)
        .await
        .context("failed to remove watch")?;
    Ok(())
}

pub async fn is_mutual_watch(pool: &DbPool, user_a: &str, user_b: &str) -> anyhow::Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM watchlists w1 \
         JOIN watchlists w2 \
           ON w1.watcher_user_id = w2.target_user_id AND w1.target_user_id = w2.watcher_user_id \
         WHERE w1.watcher_user_id = $1 AND w1.target_user_id = $2",
    )
    .bind(user_a)
    .bind(user_b)
    .fetch_one(pool)
    .await
    .context("failed to check mutual watch")?;
    Ok(count > 0)
}

pub async fn watchers_of(pool: &DbPool, target_user_id: &str) -> anyhow::Result<Vec<WatchEdge>> {
    let rows = sqlx::query_as::<_, WatchEdge>(
        "SELECT * FROM watchlists WHERE target_user_id = $1",
    )
    .bind(target_user_id)
    .fetch_all(pool)
    .await
    .context("failed to list watchers")?;
    Ok(rows)
}

pub async fn watchlist_size(pool: &DbPool, watcher_user_id: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watchlists WHERE watcher_user_id = $1")
        .bind(watcher_user_id)
        .fetch_one(pool)
        .await
        .context("failed to count watchlist")?;
    Ok(count)
}

pub async fn watchers_count(pool: &DbPool, target_user_id: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watchlists WHERE target_user_id = $1")
        .bind(target_user_id)
        .fetch_one(pool)
        .await
        .context("failed to count watchers")?;
    Ok(count)
}

pub async fn is_blocked(pool: &DbPool, user_id: &str, other_user_id: &str) -> anyhow::Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM blocklists \
         WHERE (user_id = $1 AND blocked_user_id = $2) OR (user_id = $2 AND blocked_user_id = $1)",
    )
    .bind(user_id)
    .bind(other_user_id)
    .fetch_one(pool)
    .await
    .context("failed to check blocklist")?;
    Ok(count > 0)
}

#[allow(dead_code)]
pub async fn block_user(pool: &DbPool, user_id: &str, blocked_user_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO blocklists (user_id, blocked_user_id) VALUES ($1, $2) \
         ON CONFLICT (user_id, blocked_user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(blocked_user_id)
    .execute(pool)
    .await
    .context("failed to block user")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> DbPool {
        init_db(&DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .expect("memory pool")
    }

    #[tokio::test]
    async fn allocate_and_insert_assigns_sequential_seq() {
        let pool = memory_pool().await;
        ensure_conversation(&pool, "conv1", "gw_local", "dm", None)
            .await
            .unwrap();

        let first = allocate_and_insert(&pool, "conv1", "m1", b"hello", "gw_local")
            .await
            .unwrap();
        let second = allocate_and_insert(&pool, "conv1", "m2", b"world", "gw_local")
            .await
            .unwrap();

        match (first, second) {
            (SendOutcome::Inserted(a), SendOutcome::Inserted(b)) => {
                assert_eq!(a.seq, 1);
                assert_eq!(b.seq, 2);
            }
            _ => panic!("expected both inserts to be new"),
        }
    }

    #[tokio::test]
    async fn duplicate_msg_id_returns_existing_seq() {
        let pool = memory_pool().await;
        ensure_conversation(&pool, "conv1", "gw_local", "dm", None)
            .await
            .unwrap();

        let first = allocate_and_insert(&pool, "conv1", "m1", b"hello", "gw_local")
            .await
            .unwrap();
        let retry = allocate_and_insert(&pool, "conv1", "m1", b"hello-again", "gw_local")
            .await
            .unwrap();

        let (SendOutcome::Inserted(a) | SendOutcome::Duplicate(a)) = first;
        let (SendOutcome::Inserted(b) | SendOutcome::Duplicate(b)) = retry;
        assert_eq!(a.seq, b.seq);
        assert_eq!(b.env, a.env, "duplicate send must not overwrite the original envelope");
    }

    #[tokio::test]
    async fn cursor_ack_never_regresses() {
        let pool = memory_pool().await;
        ack_cursor(&pool, "dev1", "conv1", 5).await.unwrap();
        ack_cursor(&pool, "dev1", "conv1", 2).await.unwrap();
        let cursor = get_cursor(&pool, "dev1", "conv1").await.unwrap().unwrap();
        assert_eq!(cursor.next_seq, 6);
    }

    #[tokio::test]
    async fn keypackage_fetch_is_one_shot() {
        let pool = memory_pool().await;
        publish_keypackage(&pool, "dev1", "user1", b"blob", "hash1")
            .await
            .unwrap();

        let first = fetch_one_keypackage(&pool, "user1").await.unwrap();
        assert!(first.is_some());
        let second = fetch_one_keypackage(&pool, "user1").await.unwrap();
        assert!(second.is_none(), "key package must not be served twice");
    }
}
