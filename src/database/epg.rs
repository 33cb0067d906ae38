//! EPG read-side repository
//!
//! Ingestion is handled elsewhere; the bridge only queries. The guide
//! resolver in `crate::epg` layers the channel-matching fallbacks on top
//! of these window queries.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::errors::AppError;
use crate::models::{EpgChannel, EpgProgram};

#[derive(Debug, FromRow)]
struct ProgramRow {
    id: String,
    channel_id: String,
    title: String,
    description: Option<String>,
    category: Option<String>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl From<ProgramRow> for EpgProgram {
    fn from(row: ProgramRow) -> Self {
        EpgProgram {
            id: row.id,
            channel_id: row.channel_id,
            title: row.title,
            description: row.description,
            category: row.category,
            start_time: row.start_time,
            end_time: row.end_time,
        }
    }
}

#[derive(Debug, FromRow)]
struct EpgChannelRow {
    id: String,
    source_id: String,
    epg_id: String,
    display_name: String,
    icon_url: Option<String>,
}

impl From<EpgChannelRow> for EpgChannel {
    fn from(row: EpgChannelRow) -> Self {
        EpgChannel {
            id: row.id,
            source_id: row.source_id,
            epg_id: row.epg_id,
            display_name: row.display_name,
            icon_url: row.icon_url,
        }
    }
}

#[derive(Clone)]
pub struct EpgRepository {
    pool: SqlitePool,
}

impl EpgRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Programs for an EPG channel id overlapping [start, end).
    /// Overlap means `start_time < end AND end_time > start`.
    pub async fn programs_in_window(
        &self,
        epg_channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EpgProgram>, AppError> {
        let rows = sqlx::query_as::<_, ProgramRow>(
            "SELECT * FROM epg_programs \
             WHERE channel_id = ? AND start_time < ? AND end_time > ? \
             ORDER BY start_time",
        )
        .bind(epg_channel_id)
        .bind(end)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EpgProgram::from).collect())
    }

    /// Exact match on the id an EPG feed advertises for a channel.
    pub async fn find_channel_by_epg_id(
        &self,
        epg_id: &str,
    ) -> Result<Option<EpgChannel>, AppError> {
        let row = sqlx::query_as::<_, EpgChannelRow>(
            "SELECT * FROM epg_channels WHERE epg_id = ? LIMIT 1",
        )
        .bind(epg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EpgChannel::from))
    }

    /// Case-insensitive display-name match, used as the last resort of the
    /// resolver chain.
    pub async fn find_channel_by_display_name(
        &self,
        name: &str,
    ) -> Result<Option<EpgChannel>, AppError> {
        let row = sqlx::query_as::<_, EpgChannelRow>(
            "SELECT * FROM epg_channels WHERE lower(display_name) = lower(?) LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(EpgChannel::from(row)));
        }
        let row = sqlx::query_as::<_, EpgChannelRow>(
            "SELECT * FROM epg_channels WHERE lower(display_name) LIKE lower(?) \
             ORDER BY length(display_name) LIMIT 1",
        )
        .bind(format!("%{}%", name))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EpgChannel::from))
    }

    #[cfg(test)]
    pub async fn insert_program_for_test(
        &self,
        program: &EpgProgram,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO epg_programs (id, channel_id, title, description, category, \
             start_time, end_time) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&program.id)
        .bind(&program.channel_id)
        .bind(&program.title)
        .bind(&program.description)
        .bind(&program.category)
        .bind(program.start_time)
        .bind(program.end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn insert_channel_for_test(&self, channel: &EpgChannel) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO epg_sources (id, name, url) VALUES (?, 'test', 'http://feed') \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&channel.source_id)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO epg_channels (id, source_id, epg_id, display_name, icon_url) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&channel.id)
        .bind(&channel.source_id)
        .bind(&channel.epg_id)
        .bind(&channel.display_name)
        .bind(&channel.icon_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
