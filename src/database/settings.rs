//! Flat settings rows
//!
//! The settings service owns the typed tree; this repository only moves
//! `(key, value, value_type)` rows in and out of SQLite. Values are stored
//! as text with a type tag so numbers and booleans survive the round trip.

use sqlx::{FromRow, SqlitePool};

use crate::errors::AppError;

/// One persisted dotted-key setting.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub value_type: String,
}

impl SettingRow {
    pub fn from_json(key: &str, value: &serde_json::Value) -> Self {
        let (text, value_type) = match value {
            serde_json::Value::String(s) => (s.clone(), "string"),
            serde_json::Value::Number(n) => (n.to_string(), "number"),
            serde_json::Value::Bool(b) => (b.to_string(), "boolean"),
            other => (other.to_string(), "json"),
        };
        SettingRow {
            key: key.to_string(),
            value: text,
            value_type: value_type.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self.value_type.as_str() {
            "number" => {
                // integers must come back as integers or typed
                // deserialization of the tree rejects them
                if let Ok(i) = self.value.parse::<i64>() {
                    serde_json::Value::Number(i.into())
                } else {
                    self.value
                        .parse::<f64>()
                        .ok()
                        .and_then(|n| {
                            serde_json::Number::from_f64(n).map(serde_json::Value::Number)
                        })
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            "boolean" => serde_json::Value::Bool(self.value == "true"),
            "json" => serde_json::from_str(&self.value).unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::String(self.value.clone()),
        }
    }
}

#[derive(Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn all_rows(&self) -> Result<Vec<SettingRow>, AppError> {
        let rows = sqlx::query_as::<_, SettingRow>(
            "SELECT key, value, value_type FROM settings ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert-or-replace every row in one transaction.
    pub async fn upsert_many(&self, rows: &[SettingRow]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO settings (key, value, value_type) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 value_type = excluded.value_type",
            )
            .bind(&row.key)
            .bind(&row.value)
            .bind(&row.value_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Seed rows that do not exist yet; existing values are left alone.
    /// Lets a newer version add defaults without clobbering operator edits.
    pub async fn seed_missing(&self, rows: &[SettingRow]) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO settings (key, value, value_type) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(&row.key)
            .bind(&row.value)
            .bind(&row.value_type)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Delete all rows, or only those under `category.` when given.
    pub async fn delete_category(&self, category: Option<&str>) -> Result<u64, AppError> {
        let affected = match category {
            Some(category) => {
                sqlx::query("DELETE FROM settings WHERE key = ? OR key LIKE ?")
                    .bind(category)
                    .bind(format!("{category}.%"))
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            None => sqlx::query("DELETE FROM settings")
                .execute(&self.pool)
                .await?
                .rows_affected(),
        };
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;

    #[test]
    fn row_type_tags_round_trip() {
        let cases = [
            serde_json::json!("hls"),
            serde_json::json!(42.0),
            serde_json::json!(true),
            serde_json::json!({"nested": [1, 2]}),
        ];
        for value in cases {
            let row = SettingRow::from_json("k", &value);
            assert_eq!(row.to_json(), value, "value {value} mangled");
        }
    }

    #[tokio::test]
    async fn seed_missing_never_overwrites() {
        let (db, _dir) = test_database().await;
        let repo = SettingsRepository::new(db.pool().clone());

        repo.upsert_many(&[SettingRow::from_json(
            "streaming.maxConcurrentStreams",
            &serde_json::json!(15.0),
        )])
        .await
        .unwrap();

        let inserted = repo
            .seed_missing(&[
                SettingRow::from_json("streaming.maxConcurrentStreams", &serde_json::json!(5.0)),
                SettingRow::from_json("streaming.streamTimeout", &serde_json::json!(30000.0)),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = repo.all_rows().await.unwrap();
        let max = rows
            .iter()
            .find(|r| r.key == "streaming.maxConcurrentStreams")
            .unwrap();
        assert_eq!(max.to_json(), serde_json::json!(15.0));
    }

    #[tokio::test]
    async fn delete_category_scopes_to_prefix() {
        let (db, _dir) = test_database().await;
        let repo = SettingsRepository::new(db.pool().clone());
        repo.upsert_many(&[
            SettingRow::from_json("device.name", &serde_json::json!("Bridge")),
            SettingRow::from_json("device.tunerCount", &serde_json::json!(4.0)),
            SettingRow::from_json("network.streamingPort", &serde_json::json!(8080.0)),
        ])
        .await
        .unwrap();

        let removed = repo.delete_category(Some("device")).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = repo.all_rows().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "network.streamingPort");
    }
}
