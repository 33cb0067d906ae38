//! Channel and stream repositories

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Channel, Stream, StreamAuth, StreamKind};

#[derive(Debug, FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    number: i64,
    enabled: bool,
    logo_url: Option<String>,
    epg_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            id: row.id,
            name: row.name,
            number: row.number,
            enabled: row.enabled,
            logo_url: row.logo_url,
            epg_id: row.epg_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StreamRow {
    id: String,
    channel_id: String,
    name: String,
    url: String,
    kind: String,
    backup_urls: String,
    auth_username: Option<String>,
    auth_password: Option<String>,
    headers: String,
    options: String,
    enabled: bool,
    connection_limited: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StreamRow> for Stream {
    type Error = AppError;

    fn try_from(row: StreamRow) -> Result<Self, Self::Error> {
        let kind: StreamKind = row
            .kind
            .parse()
            .map_err(|message| AppError::Validation { message })?;
        let auth = match (row.auth_username, row.auth_password) {
            (Some(username), Some(password)) => Some(StreamAuth { username, password }),
            _ => None,
        };
        Ok(Stream {
            id: row.id,
            channel_id: row.channel_id,
            name: row.name,
            url: row.url,
            kind,
            backup_urls: serde_json::from_str(&row.backup_urls).unwrap_or_default(),
            auth,
            headers: serde_json::from_str(&row.headers).unwrap_or_default(),
            options: serde_json::from_str(&row.options).unwrap_or_default(),
            enabled: row.enabled,
            connection_limited: row.connection_limited,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields accepted when creating or importing a channel.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChannel {
    pub name: String,
    pub number: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub logo_url: Option<String>,
    pub epg_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone)]
pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn validate_number(number: i64) -> Result<(), AppError> {
        if !(1..=9999).contains(&number) {
            return Err(AppError::Validation {
                message: format!("channel number {number} outside [1, 9999]"),
            });
        }
        Ok(())
    }

    pub async fn create(&self, new: NewChannel) -> Result<Channel, AppError> {
        Self::validate_number(new.number)?;
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO channels (id, name, number, enabled, logo_url, epg_id) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.number)
        .bind(new.enabled)
        .bind(&new.logo_url)
        .bind(&new.epg_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Validation {
                message: format!("channel number {} already in use", new.number),
            },
            _ => AppError::Database(e),
        })?;
        self.get(&id).await?.ok_or_else(|| AppError::NotFound {
            resource: "channel".into(),
            id,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Channel>, AppError> {
        let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Channel::from))
    }

    pub async fn find_by_number(&self, number: i64) -> Result<Option<Channel>, AppError> {
        let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE number = ?")
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Channel::from))
    }

    /// Enabled channels ordered by number: the lineup the tuner publishes.
    pub async fn lineup(&self) -> Result<Vec<Channel>, AppError> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT * FROM channels WHERE enabled = 1 ORDER BY number",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Channel::from).collect())
    }

    pub async fn list(&self) -> Result<Vec<Channel>, AppError> {
        let rows = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels ORDER BY number")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Channel::from).collect())
    }

    /// Bulk import path: insert new numbers, refresh name/logo/epg on
    /// existing ones. Numbers stay unique among live channels.
    pub async fn upsert_many(&self, channels: Vec<NewChannel>) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for new in channels {
            Self::validate_number(new.number)?;
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO channels (id, name, number, enabled, logo_url, epg_id) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(number) DO UPDATE SET \
                     name = excluded.name, \
                     logo_url = excluded.logo_url, \
                     epg_id = excluded.epg_id",
            )
            .bind(&id)
            .bind(&new.name)
            .bind(new.number)
            .bind(new.enabled)
            .bind(&new.logo_url)
            .bind(&new.epg_id)
            .execute(&mut *tx)
            .await?;
            written += 1;
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Deleting a channel cascades to its streams (FK).
    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Fields accepted when attaching a stream to a channel.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStream {
    pub channel_id: String,
    pub name: String,
    pub url: String,
    pub kind: StreamKind,
    #[serde(default)]
    pub backup_urls: Vec<String>,
    pub auth: Option<StreamAuth>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub connection_limited: bool,
}

#[derive(Clone)]
pub struct StreamRepository {
    pool: SqlitePool,
}

impl StreamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewStream) -> Result<Stream, AppError> {
        if !crate::utils::url::UrlUtils::is_valid(&new.url) {
            return Err(AppError::Validation {
                message: format!("stream URL is not a well-formed absolute URL: {}", new.url),
            });
        }
        for backup in &new.backup_urls {
            if !crate::utils::url::UrlUtils::is_valid(backup) {
                return Err(AppError::Validation {
                    message: format!("backup URL is not a well-formed absolute URL: {backup}"),
                });
            }
        }
        let id = Uuid::new_v4().to_string();
        let (auth_username, auth_password) = match &new.auth {
            Some(a) => (Some(a.username.clone()), Some(a.password.clone())),
            None => (None, None),
        };
        sqlx::query(
            "INSERT INTO streams (id, channel_id, name, url, kind, backup_urls, \
             auth_username, auth_password, headers, options, enabled, connection_limited) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.channel_id)
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.kind.as_str())
        .bind(serde_json::to_string(&new.backup_urls).unwrap_or_else(|_| "[]".into()))
        .bind(&auth_username)
        .bind(&auth_password)
        .bind(serde_json::to_string(&new.headers).unwrap_or_else(|_| "{}".into()))
        .bind(serde_json::to_string(&new.options).unwrap_or_else(|_| "{}".into()))
        .bind(new.enabled)
        .bind(new.connection_limited)
        .execute(&self.pool)
        .await?;
        self.get(&id).await?.ok_or_else(|| AppError::NotFound {
            resource: "stream".into(),
            id,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Stream>, AppError> {
        let row = sqlx::query_as::<_, StreamRow>("SELECT * FROM streams WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Stream::try_from).transpose()
    }

    /// The stream a tuner request for the channel should play: the oldest
    /// enabled one. Backup URLs on the stream itself handle failover.
    pub async fn primary_for_channel(&self, channel_id: &str) -> Result<Option<Stream>, AppError> {
        let row = sqlx::query_as::<_, StreamRow>(
            "SELECT * FROM streams WHERE channel_id = ? AND enabled = 1 \
             ORDER BY created_at, rowid LIMIT 1",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Stream::try_from).transpose()
    }

    pub async fn list_for_channel(&self, channel_id: &str) -> Result<Vec<Stream>, AppError> {
        let rows = sqlx::query_as::<_, StreamRow>(
            "SELECT * FROM streams WHERE channel_id = ? ORDER BY created_at, rowid",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Stream::try_from).collect()
    }

    pub async fn count_for_channel(&self, channel_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM streams WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;

    fn channel(name: &str, number: i64) -> NewChannel {
        NewChannel {
            name: name.to_string(),
            number,
            enabled: true,
            logo_url: None,
            epg_id: None,
        }
    }

    fn stream_for(channel_id: &str, url: &str) -> NewStream {
        NewStream {
            channel_id: channel_id.to_string(),
            name: "main".to_string(),
            url: url.to_string(),
            kind: StreamKind::Hls,
            backup_urls: vec![],
            auth: None,
            headers: Default::default(),
            options: Default::default(),
            enabled: true,
            connection_limited: false,
        }
    }

    #[tokio::test]
    async fn channel_numbers_are_unique() {
        let (db, _dir) = test_database().await;
        let repo = ChannelRepository::new(db.pool().clone());

        repo.create(channel("News", 100)).await.unwrap();
        let err = repo.create(channel("Other News", 100)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn channel_number_range_enforced() {
        let (db, _dir) = test_database().await;
        let repo = ChannelRepository::new(db.pool().clone());
        assert!(repo.create(channel("Zero", 0)).await.is_err());
        assert!(repo.create(channel("TooBig", 10_000)).await.is_err());
        assert!(repo.create(channel("Edge", 9999)).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_channel_cascades_to_streams() {
        let (db, _dir) = test_database().await;
        let channels = ChannelRepository::new(db.pool().clone());
        let streams = StreamRepository::new(db.pool().clone());

        let ch = channels.create(channel("Sports", 5)).await.unwrap();
        let st = streams
            .create(stream_for(&ch.id, "https://origin.example/sports.m3u8"))
            .await
            .unwrap();

        assert!(channels.delete(&ch.id).await.unwrap());
        assert!(streams.get(&st.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_url_must_be_absolute() {
        let (db, _dir) = test_database().await;
        let channels = ChannelRepository::new(db.pool().clone());
        let streams = StreamRepository::new(db.pool().clone());

        let ch = channels.create(channel("Movies", 7)).await.unwrap();
        let err = streams
            .create(stream_for(&ch.id, "not-a-url"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn primary_stream_is_oldest_enabled() {
        let (db, _dir) = test_database().await;
        let channels = ChannelRepository::new(db.pool().clone());
        let streams = StreamRepository::new(db.pool().clone());

        let ch = channels.create(channel("Docs", 9)).await.unwrap();
        let first = streams
            .create(stream_for(&ch.id, "https://origin.example/a.m3u8"))
            .await
            .unwrap();
        streams
            .create(stream_for(&ch.id, "https://origin.example/b.m3u8"))
            .await
            .unwrap();

        let primary = streams.primary_for_channel(&ch.id).await.unwrap().unwrap();
        assert_eq!(primary.id, first.id);
    }

    #[tokio::test]
    async fn upsert_many_refreshes_existing_numbers() {
        let (db, _dir) = test_database().await;
        let repo = ChannelRepository::new(db.pool().clone());
        repo.create(channel("Old Name", 42)).await.unwrap();

        repo.upsert_many(vec![channel("New Name", 42), channel("Fresh", 43)])
            .await
            .unwrap();

        let by_number = repo.find_by_number(42).await.unwrap().unwrap();
        assert_eq!(by_number.name, "New Name");
        assert!(repo.find_by_number(43).await.unwrap().is_some());
    }
}
