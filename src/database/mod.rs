//! Metadata store
//!
//! A single-file SQLite database holding channels, streams, EPG data,
//! session history, settings rows and logs. Writes funnel through sqlx's
//! pool (SQLite serializes them); callers that need multi-statement
//! atomicity use [`Database::transaction`].
//!
//! Startup recovers from file-level corruption by renaming the damaged
//! file aside and re-initializing. After an unrecoverable runtime error
//! the store flips unhealthy and refuses work; health endpoints report it
//! instead of the process crashing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub mod channels;
pub mod epg;
pub mod logs;
pub mod sessions;
pub mod settings;

pub use channels::{ChannelRepository, StreamRepository};
pub use epg::EpgRepository;
pub use logs::LogRepository;
pub use sessions::SessionRepository;
pub use settings::{SettingRow, SettingsRepository};

const SCHEMA: &str = include_str!("schema.sql");

/// EPG programs older than this are purged by the retention job.
const EPG_RETENTION_DAYS: i64 = 7;
/// Session history and log rows older than this are purged.
const HISTORY_RETENTION_DAYS: i64 = 30;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
    healthy: Arc<AtomicBool>,
}

impl Database {
    /// Open (or create) the database file, recovering from corruption,
    /// then apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let pool = match Self::open_and_check(&path).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Database at {} failed integrity check: {e}", path.display());
                Self::quarantine(&path).await?;
                Self::open_and_check(&path)
                    .await
                    .context("re-initializing database after corruption recovery")?
            }
        };

        Self::apply_pragmas(&pool).await;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("applying database schema")?;

        info!("Metadata store ready at {}", path.display());
        Ok(Self {
            pool,
            path,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn open_and_check(path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if verdict != "ok" {
            pool.close().await;
            anyhow::bail!("quick_check reported: {verdict}");
        }
        Ok(pool)
    }

    /// Rename a damaged database file aside so a fresh one can be created.
    async fn quarantine(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let stamp = Utc::now().format("%Y%m%d%H%M%S");
            let aside = path.with_extension(format!("corrupt-{stamp}"));
            tokio::fs::rename(path, &aside)
                .await
                .with_context(|| format!("moving corrupt database to {}", aside.display()))?;
            warn!("Corrupt database moved aside to {}", aside.display());
        }
        // WAL sidecars from the damaged file must not bleed into the new one
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = tokio::fs::remove_file(PathBuf::from(sidecar)).await;
        }
        Ok(())
    }

    /// Performance PRAGMAs. WAL requires real file locking; filesystems
    /// with weak locking semantics (some network mounts) refuse it, in
    /// which case the remaining tuning is skipped too.
    async fn apply_pragmas(pool: &SqlitePool) {
        let mode: Result<String, sqlx::Error> = sqlx::query_scalar("PRAGMA journal_mode=WAL")
            .fetch_one(pool)
            .await;
        match mode.as_deref() {
            Ok("wal") => {
                for pragma in [
                    "PRAGMA busy_timeout=5000",
                    "PRAGMA synchronous=NORMAL",
                    "PRAGMA cache_size=-8000",
                ] {
                    if let Err(e) = sqlx::raw_sql(pragma).execute(pool).await {
                        warn!("Skipping {pragma}: {e}");
                    }
                }
            }
            Ok(other) => {
                warn!("Filesystem declined WAL (journal_mode={other}); skipping performance PRAGMAs");
            }
            Err(e) => {
                warn!("Could not configure journal mode: {e}");
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a single transaction.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, sqlx::Error>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::SqliteConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        let mut tx = self.pool.begin().await?;
        let out = f(&mut *tx).await?;
        tx.commit().await?;
        Ok(out)
    }

    /// Trivial query probe; also refreshes the health flag.
    pub async fn ping(&self) -> bool {
        let ok = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok();
        self.healthy.store(ok, Ordering::Relaxed);
        ok
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Retention: drop expired EPG programs, old session history and old
    /// logs, then compact the file.
    pub async fn cleanup(&self) -> Result<(), sqlx::Error> {
        let epg_cutoff = Utc::now() - chrono::Duration::days(EPG_RETENTION_DAYS);
        let history_cutoff = Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS);

        let programs = sqlx::query("DELETE FROM epg_programs WHERE end_time < ?")
            .bind(epg_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let sessions = sqlx::query("DELETE FROM stream_sessions WHERE started_at < ?")
            .bind(history_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let logs = sqlx::query("DELETE FROM logs WHERE timestamp < ?")
            .bind(history_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        sqlx::raw_sql("VACUUM").execute(&self.pool).await?;
        info!(
            "Database cleanup removed {programs} EPG programs, {sessions} sessions, {logs} log rows"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fresh on-disk database inside a tempdir (SQLite in-memory pools
    /// hand each connection its own database, which breaks pooled tests).
    pub async fn test_database() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir
                .path()
                .join("test.db")
                .to_string_lossy()
                .into_owned(),
        };
        let db = Database::connect(&config).await.unwrap();
        (db, dir)
    }
}
