use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tuner_bridge::{
    cache::CacheService,
    config::Config,
    database::{
        ChannelRepository, Database, EpgRepository, LogRepository, SessionRepository,
        StreamRepository,
    },
    epg::EpgService,
    events::{names, EventBus, Room},
    settings::SettingsService,
    ssdp::SsdpService,
    streaming::{
        detector::MAX_REDIRECTS, proxy::StreamProxy, FfmpegCommandBuilder, FormatDetector,
        SessionLimits, SessionManager,
    },
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "tuner-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HDHomeRun tuner emulation bridging Plex live TV to IPTV sources")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database file path (overrides config file)
    #[arg(short = 'd', long, value_name = "PATH")]
    database: Option<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tuner_bridge={}", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database) = cli.database {
        config.database.path = database;
    }
    let config = Arc::new(config);
    info!(
        "tuner-bridge v{} starting on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.web.host,
        config.web.port
    );

    // persistence
    let database = Database::connect(&config.database).await?;
    let channels = ChannelRepository::new(database.pool().clone());
    let streams = StreamRepository::new(database.pool().clone());
    let session_history = SessionRepository::new(database.pool().clone());
    let logs = LogRepository::new(database.pool().clone());

    // settings, cache, events
    let settings = Arc::new(SettingsService::new(
        tuner_bridge::database::SettingsRepository::new(database.pool().clone()),
    ));
    settings.seed_defaults().await?;
    let initial_settings = settings.load().await;

    let cache = match &config.cache.redis_url {
        Some(url) => CacheService::with_redis_upgrade(url.clone()),
        None => CacheService::new(),
    };
    let events = EventBus::default();

    // streaming fabric
    let session_manager = Arc::new(SessionManager::new(
        session_history.clone(),
        events.clone(),
        SessionLimits::from_settings(&initial_settings),
    ));
    session_manager.start_background_tasks();
    session_manager.watch_settings(settings.subscribe());

    let http = reqwest::Client::builder()
        .user_agent(config.http.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .connect_timeout(Duration::from_secs(config.http.request_timeout_secs))
        .build()?;
    let detector = Arc::new(FormatDetector::new(http.clone()));
    let encoder = Arc::new(FfmpegCommandBuilder::new(
        config.encoder.ffmpeg_path.clone(),
        config.http.user_agent.clone(),
    ));
    let proxy = StreamProxy {
        sessions: session_manager.clone(),
        settings: settings.clone(),
        cache: cache.clone(),
        detector,
        encoder,
        http: http.clone(),
    };

    // discovery
    let ssdp = Arc::new(SsdpService::new(&initial_settings));
    if let Err(e) = ssdp.start().await {
        warn!("SSDP discovery unavailable: {e}");
    }
    ssdp.watch_settings(settings.subscribe());

    // settings changes fan out to operator clients
    {
        let events = events.clone();
        let mut rx = settings.subscribe();
        tokio::spawn(async move {
            while let Ok(change) = rx.recv().await {
                events.publish(
                    Room::Settings,
                    names::SETTINGS_UPDATED,
                    serde_json::json!({ "changed": change.changed }),
                );
            }
        });
    }

    // session lifecycle audit trail into the logs table
    {
        let logs = logs.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.event == names::SESSION_STARTED || event.event == names::SESSION_ENDED {
                    if let Err(e) = logs.insert("info", &event.event, Some(&event.data)).await {
                        warn!("Audit log insert failed: {e}");
                    }
                }
            }
        });
    }

    // retention: EPG, history and log rows age out daily
    {
        let database = database.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            tick.tick().await; // skip the immediate tick
            loop {
                tick.tick().await;
                if let Err(e) = database.cleanup().await {
                    warn!("Database cleanup failed: {e}");
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        database: database.clone(),
        channels,
        streams,
        session_history,
        logs,
        settings: settings.clone(),
        cache,
        epg: EpgService::new(EpgRepository::new(database.pool().clone())),
        session_manager: session_manager.clone(),
        events,
        ssdp: ssdp.clone(),
        proxy,
        started_at: std::time::Instant::now(),
        system: Arc::new(tokio::sync::RwLock::new(sysinfo::System::new_all())),
    };

    // On a termination signal: stop admissions, end every session (which
    // also reaps the encoder children), stop discovery, then let the
    // server drain.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let session_manager = session_manager.clone();
        let ssdp = ssdp.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("Termination signal received, shutting down");
            let ended = session_manager.shutdown().await;
            if ended > 0 {
                info!("Ended {ended} active sessions");
            }
            ssdp.stop().await;
            let _ = shutdown_tx.send(());
        });
    }

    WebServer::new(state)?
        .serve(async {
            let _ = shutdown_rx.await;
        })
        .await?;

    database.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
