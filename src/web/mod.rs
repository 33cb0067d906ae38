//! HTTP layer
//!
//! Two surfaces share one router: the HDHomeRun emulation endpoints Plex
//! talks to (bit-exact JSON/XML shapes) and the operator JSON API.
//! Handlers stay thin and delegate to the services carried in
//! [`AppState`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::CacheService;
use crate::config::Config;
use crate::database::{
    ChannelRepository, Database, LogRepository, SessionRepository, StreamRepository,
};
use crate::epg::EpgService;
use crate::events::EventBus;
use crate::settings::SettingsService;
use crate::ssdp::SsdpService;
use crate::streaming::proxy::{ClientInfo, StreamProxy};
use crate::streaming::SessionManager;

pub mod api;
pub mod health;
pub mod tuner;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Database,
    pub channels: ChannelRepository,
    pub streams: StreamRepository,
    pub session_history: SessionRepository,
    pub logs: LogRepository,
    pub settings: Arc<SettingsService>,
    pub cache: CacheService,
    pub epg: EpgService,
    pub session_manager: Arc<SessionManager>,
    pub events: EventBus,
    pub ssdp: Arc<SsdpService>,
    pub proxy: StreamProxy,
    pub started_at: std::time::Instant,
    pub system: Arc<tokio::sync::RwLock<sysinfo::System>>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", state.config.web.host, state.config.web.port)
            .parse()?;
        let app = router(state);
        Ok(Self { app, addr })
    }

    /// Bind and serve until the shutdown future resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Web server listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}

/// The full route table: tuner surface, health, operator API, event bus.
pub fn router(state: AppState) -> Router {
    Router::new()
        // tuner emulation surface
        .route("/discover.json", get(tuner::discover))
        .route("/device.xml", get(tuner::device_xml))
        .route("/lineup.json", get(tuner::lineup))
        .route("/lineup_status.json", get(tuner::lineup_status))
        .route("/stream/{channel_id}", get(tuner::stream_channel))
        .route("/stream/{channel_id}/{*segment}", get(tuner::stream_segment))
        // health
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        // operator API
        .route("/api/streaming/active", get(api::streaming_active))
        .route("/api/streaming/capacity", get(api::streaming_capacity))
        .route("/api/streaming/bandwidth", get(api::streaming_bandwidth))
        .route("/api/streaming/stats", get(api::streaming_stats))
        .route("/api/streaming/history", get(api::streaming_history))
        .route(
            "/api/streaming/sessions/{session_id}",
            delete(api::terminate_session),
        )
        .route(
            "/api/streaming/sessions/client/{client_id}",
            delete(api::terminate_client_sessions),
        )
        .route("/api/streaming/cleanup", post(api::cleanup_sessions))
        .route("/api/settings", get(api::get_settings).put(api::put_settings))
        .route("/api/settings/reset", post(api::reset_settings))
        .route("/api/channels", get(api::list_channels))
        .route("/api/epg/{channel_id}", get(api::channel_guide))
        .route("/api/logs", get(api::recent_logs))
        // event bus
        .route("/ws", get(api::websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Pull the pieces of [`ClientInfo`] out of the request.
pub fn client_info(addr: SocketAddr, headers: &HeaderMap) -> ClientInfo {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    ClientInfo {
        addr: addr.ip().to_string(),
        user_agent,
        forwarded_for,
    }
}
