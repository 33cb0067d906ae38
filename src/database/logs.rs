//! Log row repository backing `/api/logs`

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::errors::AppError;

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub meta: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LogRepository {
    pool: SqlitePool,
}

impl LogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        level: &str,
        message: &str,
        meta: Option<&serde_json::Value>,
    ) -> Result<(), AppError> {
        sqlx::query("INSERT INTO logs (level, message, meta) VALUES (?, ?, ?)")
            .bind(level)
            .bind(message)
            .bind(meta.map(|m| m.to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent(
        &self,
        level: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LogEntry>, AppError> {
        let rows = match level {
            Some(level) => {
                sqlx::query_as::<_, LogEntry>(
                    "SELECT * FROM logs WHERE level = ? ORDER BY timestamp DESC, id DESC \
                     LIMIT ? OFFSET ?",
                )
                .bind(level)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, LogEntry>(
                    "SELECT * FROM logs ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;

    #[tokio::test]
    async fn insert_and_page_by_level() {
        let (db, _dir) = test_database().await;
        let repo = LogRepository::new(db.pool().clone());

        repo.insert("info", "session started", None).await.unwrap();
        repo.insert(
            "error",
            "encoder exited",
            Some(&serde_json::json!({"sessionId": "s1"})),
        )
        .await
        .unwrap();

        let errors = repo.recent(Some("error"), 10, 0).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "encoder exited");

        let all = repo.recent(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
