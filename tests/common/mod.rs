//! Shared fixtures for the integration suites

use std::sync::Arc;

use tuner_bridge::{
    cache::CacheService,
    config::{Config, DatabaseConfig},
    database::{
        ChannelRepository, Database, EpgRepository, LogRepository, SessionRepository,
        SettingsRepository, StreamRepository,
    },
    epg::EpgService,
    events::EventBus,
    settings::SettingsService,
    ssdp::SsdpService,
    streaming::{
        proxy::StreamProxy, FfmpegCommandBuilder, FormatDetector, SessionLimits, SessionManager,
    },
    web::AppState,
};

pub async fn test_database() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: dir.path().join("test.db").to_string_lossy().into_owned(),
    };
    let db = Database::connect(&config).await.unwrap();
    (db, dir)
}

pub async fn test_state() -> (AppState, tempfile::TempDir) {
    let (database, dir) = test_database().await;

    let settings = Arc::new(SettingsService::new(SettingsRepository::new(
        database.pool().clone(),
    )));
    settings.seed_defaults().await.unwrap();
    let initial = settings.load().await;

    let cache = CacheService::new();
    let events = EventBus::default();
    let session_history = SessionRepository::new(database.pool().clone());
    let session_manager = Arc::new(SessionManager::new(
        session_history.clone(),
        events.clone(),
        SessionLimits::from_settings(&initial),
    ));

    let http = reqwest::Client::new();
    let proxy = StreamProxy {
        sessions: session_manager.clone(),
        settings: settings.clone(),
        cache: cache.clone(),
        detector: Arc::new(FormatDetector::new(http.clone())),
        encoder: Arc::new(FfmpegCommandBuilder::new("ffmpeg", "test-agent")),
        http,
    };

    let state = AppState {
        config: Arc::new(Config::default()),
        database: database.clone(),
        channels: ChannelRepository::new(database.pool().clone()),
        streams: StreamRepository::new(database.pool().clone()),
        session_history,
        logs: LogRepository::new(database.pool().clone()),
        settings,
        cache,
        epg: EpgService::new(EpgRepository::new(database.pool().clone())),
        session_manager,
        events,
        ssdp: Arc::new(SsdpService::new(&initial)),
        proxy,
        started_at: std::time::Instant::now(),
        system: Arc::new(tokio::sync::RwLock::new(sysinfo::System::new())),
    };
    (state, dir)
}
