//! Session history repository
//!
//! Every admitted session gets a row at start; the session manager
//! finalizes it with end time, reason and final stats. The rows are the
//! audit trail behind `/api/streaming/history`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::errors::AppError;
use crate::models::{EndReason, SessionDescriptor, SessionHistoryEntry};

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: String,
    stream_id: String,
    channel_id: String,
    channel_name: String,
    channel_number: i64,
    client_addr: String,
    client_fingerprint: String,
    user_agent: Option<String>,
    stream_url: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
    bytes_transferred: i64,
    average_bitrate: i64,
    peak_bitrate: i64,
    error_count: i64,
}

impl From<SessionRow> for SessionHistoryEntry {
    fn from(row: SessionRow) -> Self {
        SessionHistoryEntry {
            session_id: row.session_id,
            stream_id: row.stream_id,
            channel_id: row.channel_id,
            channel_name: row.channel_name,
            channel_number: row.channel_number,
            client_addr: row.client_addr,
            client_fingerprint: row.client_fingerprint,
            user_agent: row.user_agent,
            stream_url: row.stream_url,
            started_at: row.started_at,
            ended_at: row.ended_at,
            end_reason: row.end_reason,
            bytes_transferred: row.bytes_transferred,
            average_bitrate: row.average_bitrate,
            peak_bitrate: row.peak_bitrate,
            error_count: row.error_count,
        }
    }
}

/// Final counters recorded when a session ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalStats {
    pub bytes_transferred: u64,
    pub average_bitrate: u64,
    pub peak_bitrate: u64,
    pub error_count: u32,
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_started(
        &self,
        descriptor: &SessionDescriptor,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO stream_sessions (session_id, stream_id, channel_id, channel_name, \
             channel_number, client_addr, client_fingerprint, user_agent, stream_url, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&descriptor.session_id)
        .bind(&descriptor.stream_id)
        .bind(&descriptor.channel_id)
        .bind(&descriptor.channel_name)
        .bind(descriptor.channel_number)
        .bind(&descriptor.client_addr)
        .bind(&descriptor.client_fingerprint)
        .bind(&descriptor.user_agent)
        .bind(&descriptor.stream_url)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finalize(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        reason: EndReason,
        stats: FinalStats,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE stream_sessions SET ended_at = ?, end_reason = ?, bytes_transferred = ?, \
             average_bitrate = ?, peak_bitrate = ?, error_count = ? WHERE session_id = ?",
        )
        .bind(ended_at)
        .bind(reason.as_str())
        .bind(stats.bytes_transferred as i64)
        .bind(stats.average_bitrate as i64)
        .bind(stats.peak_bitrate as i64)
        .bind(stats.error_count as i64)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn history(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionHistoryEntry>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM stream_sessions ORDER BY started_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SessionHistoryEntry::from).collect())
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM stream_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
