//! Runtime settings
//!
//! Persistent, typed, dotted-key settings with live propagation. The
//! typed tree (`Settings`) is what the rest of the crate consumes; the
//! flat `(key, value, type)` rows are the persistence view. Loading
//! overlays rows onto the defaults skeleton in two passes so that a
//! `plexlive.`-prefixed key always wins over its bare twin. Mutation goes
//! through [`SettingsService::update`], which validates, persists in one
//! transaction, rebuilds the tree, and broadcasts the change; subscribers
//! (session manager, SSDP, web) apply their own side effects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::database::{SettingRow, SettingsRepository};
use crate::errors::AppError;

mod tree;
pub use tree::*;

/// Keys written with this prefix shadow their bare counterparts.
const PREFIX: &str = "plexlive.";
/// How long a loaded tree is trusted before rereading the store.
const TREE_TTL: Duration = Duration::from_secs(60);

/// Broadcast on every successful update or reset.
#[derive(Debug, Clone)]
pub struct SettingsChange {
    /// Normalized dotted paths that changed (prefix stripped).
    pub changed: Vec<String>,
    pub settings: Arc<Settings>,
}

struct CachedTree {
    settings: Arc<Settings>,
    loaded_at: Instant,
}

pub struct SettingsService {
    repo: SettingsRepository,
    cached: RwLock<Option<CachedTree>>,
    tx: broadcast::Sender<SettingsChange>,
}

impl SettingsService {
    pub fn new(repo: SettingsRepository) -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            repo,
            cached: RwLock::new(None),
            tx,
        }
    }

    /// Seed defaults that are missing from the store. Run at startup; a
    /// second pass after upgrades fills in keys newer versions added.
    pub async fn seed_defaults(&self) -> Result<usize, AppError> {
        let rows = flatten(&serde_json::to_value(Settings::default()).unwrap_or_default())
            .into_iter()
            .map(|(key, value)| SettingRow::from_json(&key, &value))
            .collect::<Vec<_>>();
        let inserted = self.repo.seed_missing(&rows).await?;
        if inserted > 0 {
            info!("Seeded {inserted} missing settings defaults");
        }
        Ok(inserted)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.tx.subscribe()
    }

    /// Current tree, served from the 1-minute cache when fresh.
    pub async fn load(&self) -> Arc<Settings> {
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.loaded_at.elapsed() < TREE_TTL {
                    return entry.settings.clone();
                }
            }
        }
        self.reload().await
    }

    async fn reload(&self) -> Arc<Settings> {
        let settings = Arc::new(self.build_tree().await);
        let mut cached = self.cached.write().await;
        *cached = Some(CachedTree {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });
        settings.clone()
    }

    /// Defaults skeleton overlaid with stored rows; bare keys first, then
    /// `plexlive.`-prefixed keys so the prefixed form wins.
    async fn build_tree(&self) -> Settings {
        let rows = match self.repo.all_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Settings store unavailable, serving defaults: {e}");
                return Settings::default();
            }
        };

        let mut value = serde_json::to_value(Settings::default()).unwrap_or_default();
        for row in rows.iter().filter(|r| !r.key.starts_with(PREFIX)) {
            set_path(&mut value, &row.key, row.to_json());
        }
        for row in rows.iter().filter(|r| r.key.starts_with(PREFIX)) {
            set_path(&mut value, &row.key[PREFIX.len()..], row.to_json());
        }

        match serde_json::from_value(value) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Stored settings failed to deserialize, serving defaults: {e}");
                Settings::default()
            }
        }
    }

    /// Read a single dotted path from the live tree.
    pub async fn get(&self, path: &str) -> Option<serde_json::Value> {
        let settings = self.load().await;
        let tree = serde_json::to_value(settings.as_ref()).ok()?;
        get_path(&tree, path.strip_prefix(PREFIX).unwrap_or(path)).cloned()
    }

    /// Apply a partial tree. Accepts both bare and `plexlive.`-wrapped
    /// shapes. Validates every leaf, writes all rows in one transaction,
    /// then reloads and broadcasts.
    pub async fn update(&self, partial: serde_json::Value) -> Result<Arc<Settings>, AppError> {
        let leaves = flatten(&partial);
        if leaves.is_empty() {
            return Err(AppError::Validation {
                message: "settings update contains no values".into(),
            });
        }

        let defaults = serde_json::to_value(Settings::default()).unwrap_or_default();
        let mut rows = Vec::with_capacity(leaves.len());
        let mut changed = Vec::with_capacity(leaves.len());
        for (key, value) in &leaves {
            let normalized = key.strip_prefix(PREFIX).unwrap_or(key);
            validate_leaf(&defaults, normalized, value)?;
            rows.push(SettingRow::from_json(key, value));
            changed.push(normalized.to_string());
        }

        self.repo.upsert_many(&rows).await?;
        self.invalidate().await;
        let settings = self.reload().await;
        info!("Settings updated: {}", changed.join(", "));
        let _ = self.tx.send(SettingsChange {
            changed,
            settings: settings.clone(),
        });
        Ok(settings)
    }

    /// Drop stored rows (optionally only one category) and fall back to
    /// defaults for them.
    pub async fn reset(&self, category: Option<&str>) -> Result<Arc<Settings>, AppError> {
        if let Some(category) = category {
            if !KNOWN_CATEGORIES.contains(&category) {
                return Err(AppError::Validation {
                    message: format!("unknown settings category: {category}"),
                });
            }
        }
        self.repo.delete_category(category).await?;
        // prefixed twins shadow the bare rows; a reset must clear them too
        if let Some(category) = category {
            self.repo
                .delete_category(Some(&format!("{PREFIX}{category}")))
                .await?;
        }
        self.invalidate().await;
        let settings = self.reload().await;
        let _ = self.tx.send(SettingsChange {
            changed: vec![category.unwrap_or("*").to_string()],
            settings: settings.clone(),
        });
        Ok(settings)
    }

    async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }
}

/// Depth-first flatten of a JSON object into dotted leaf paths. Arrays
/// and scalars are leaves; objects recurse.
pub fn flatten(value: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                match child {
                    serde_json::Value::Object(_) => {
                        for (path, leaf) in flatten(child) {
                            out.push((format!("{key}.{path}"), leaf));
                        }
                    }
                    other => out.push((key.clone(), other.clone())),
                }
            }
        }
        other => out.push((String::new(), other.clone())),
    }
    out
}

fn set_path(tree: &mut serde_json::Value, path: &str, leaf: serde_json::Value) {
    let mut current = tree;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = serde_json::Value::Object(Default::default());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), leaf);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
}

fn get_path<'a>(tree: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = tree;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

const KNOWN_CATEGORIES: &[&str] = &[
    "ssdp",
    "streaming",
    "transcoding",
    "caching",
    "device",
    "network",
    "compatibility",
    "localization",
];

/// Free-form subtrees where leaves need not exist in the defaults.
const FREEFORM_PREFIXES: &[&str] = &["transcoding.qualityProfiles"];

fn validate_leaf(
    defaults: &serde_json::Value,
    path: &str,
    value: &serde_json::Value,
) -> Result<(), AppError> {
    let default_leaf = get_path(defaults, path);
    let freeform = FREEFORM_PREFIXES.iter().any(|p| path.starts_with(p));
    if default_leaf.is_none() && !freeform {
        return Err(AppError::Validation {
            message: format!("unknown settings key: {path}"),
        });
    }

    // the stored value must keep the default's JSON shape or the next
    // tree rebuild would reject the whole store
    if let Some(default_leaf) = default_leaf {
        let compatible = default_leaf.is_null()
            || value.is_null()
            || std::mem::discriminant(default_leaf) == std::mem::discriminant(value);
        if !compatible {
            return Err(AppError::Validation {
                message: format!("{path} has the wrong type"),
            });
        }
    }

    let int_in = |range: std::ops::RangeInclusive<i64>| -> Result<(), AppError> {
        match value.as_i64() {
            Some(n) if range.contains(&n) => Ok(()),
            _ => Err(AppError::Validation {
                message: format!(
                    "{path} must be an integer in [{}, {}]",
                    range.start(),
                    range.end()
                ),
            }),
        }
    };

    match path {
        "streaming.maxConcurrentStreams" => int_in(1..=100),
        "streaming.streamTimeout" => int_in(5000..=300_000),
        "device.tunerCount" => int_in(1..=32),
        "network.streamingPort" | "network.discoveryPort" => int_in(1024..=65_535),
        "localization.firstDayOfWeek" => int_in(0..=6),
        "localization.locale" => match value.as_str() {
            Some(locale) if is_valid_locale(locale) => Ok(()),
            _ => Err(AppError::Validation {
                message: format!("{path} must look like 'xx' or 'xx-XX'"),
            }),
        },
        "localization.dateFormat" => match value.as_str() {
            Some("YYYY-MM-DD" | "MM/DD/YYYY" | "DD/MM/YYYY" | "DD.MM.YYYY") => Ok(()),
            _ => Err(AppError::Validation {
                message: format!("{path} is not a supported date format"),
            }),
        },
        "localization.timeFormat" => match value.as_str() {
            Some("12h" | "24h") => Ok(()),
            _ => Err(AppError::Validation {
                message: format!("{path} must be '12h' or '24h'"),
            }),
        },
        _ => Ok(()),
    }
}

fn is_valid_locale(locale: &str) -> bool {
    let bytes = locale.as_bytes();
    match bytes.len() {
        2 => bytes.iter().all(u8::is_ascii_lowercase),
        5 => {
            bytes[0].is_ascii_lowercase()
                && bytes[1].is_ascii_lowercase()
                && bytes[2] == b'-'
                && bytes[3].is_ascii_uppercase()
                && bytes[4].is_ascii_uppercase()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;

    async fn service() -> (SettingsService, tempfile::TempDir) {
        let (db, dir) = test_database().await;
        let service = SettingsService::new(SettingsRepository::new(db.pool().clone()));
        service.seed_defaults().await.unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn defaults_load_without_rows() {
        let (service, _dir) = service().await;
        let settings = service.load().await;
        assert_eq!(settings.streaming.max_concurrent_streams, 5);
        assert_eq!(settings.streaming.stream_timeout, 30_000);
        assert_eq!(settings.device.tuner_count, 4);
        assert_eq!(settings.streaming.preferred_protocol, "hls");
    }

    #[tokio::test]
    async fn update_round_trips_every_flattened_leaf() {
        let (service, _dir) = service().await;
        let partial = serde_json::json!({
            "streaming": { "maxConcurrentStreams": 15, "streamTimeout": 60000 },
            "device": { "name": "Den Tuner" },
        });
        service.update(partial.clone()).await.unwrap();

        let settings = service.load().await;
        assert_eq!(settings.streaming.max_concurrent_streams, 15);
        assert_eq!(settings.streaming.stream_timeout, 60_000);
        assert_eq!(settings.device.name, "Den Tuner");

        for (path, expected) in flatten(&partial) {
            assert_eq!(service.get(&path).await, Some(expected), "path {path}");
        }
    }

    #[tokio::test]
    async fn plexlive_prefixed_keys_win_over_bare_ones() {
        let (service, _dir) = service().await;
        // bare row says 10, prefixed row says 20
        service
            .update(serde_json::json!({"streaming": {"maxConcurrentStreams": 10}}))
            .await
            .unwrap();
        service
            .update(serde_json::json!({"plexlive": {"streaming": {"maxConcurrentStreams": 20}}}))
            .await
            .unwrap();

        let settings = service.load().await;
        assert_eq!(settings.streaming.max_concurrent_streams, 20);

        // even if the bare key is written afterwards the prefixed row wins
        service
            .update(serde_json::json!({"streaming": {"maxConcurrentStreams": 11}}))
            .await
            .unwrap();
        let settings = service.load().await;
        assert_eq!(settings.streaming.max_concurrent_streams, 20);
    }

    #[tokio::test]
    async fn validation_rejects_out_of_range_and_unknown() {
        let (service, _dir) = service().await;
        for bad in [
            serde_json::json!({"streaming": {"maxConcurrentStreams": 0}}),
            serde_json::json!({"streaming": {"maxConcurrentStreams": 101}}),
            serde_json::json!({"streaming": {"streamTimeout": 1000}}),
            serde_json::json!({"device": {"tunerCount": 33}}),
            serde_json::json!({"network": {"streamingPort": 80}}),
            serde_json::json!({"localization": {"locale": "english"}}),
            serde_json::json!({"localization": {"dateFormat": "MM-DD-YYYY"}}),
            serde_json::json!({"localization": {"timeFormat": "25h"}}),
            serde_json::json!({"localization": {"firstDayOfWeek": 7}}),
            serde_json::json!({"nosuchcategory": {"x": 1}}),
        ] {
            assert!(service.update(bad.clone()).await.is_err(), "accepted {bad}");
        }
        // nothing stuck
        let settings = service.load().await;
        assert_eq!(settings.streaming.max_concurrent_streams, 5);
    }

    #[tokio::test]
    async fn reset_category_returns_to_defaults() {
        let (service, _dir) = service().await;
        service
            .update(serde_json::json!({"plexlive": {"device": {"tunerCount": 8}}}))
            .await
            .unwrap();
        assert_eq!(service.load().await.device.tuner_count, 8);

        service.reset(Some("device")).await.unwrap();
        assert_eq!(service.load().await.device.tuner_count, 4);

        assert!(service.reset(Some("bogus")).await.is_err());
    }

    #[tokio::test]
    async fn update_broadcasts_change() {
        let (service, _dir) = service().await;
        let mut rx = service.subscribe();
        service
            .update(serde_json::json!({"streaming": {"maxConcurrentStreams": 7}}))
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.changed, vec!["streaming.maxConcurrentStreams"]);
        assert_eq!(change.settings.streaming.max_concurrent_streams, 7);
    }

    #[test]
    fn locale_shapes() {
        assert!(is_valid_locale("en"));
        assert!(is_valid_locale("en-US"));
        assert!(!is_valid_locale("EN"));
        assert!(!is_valid_locale("en_US"));
        assert!(!is_valid_locale("eng"));
    }
}
