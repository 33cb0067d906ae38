//! Operator JSON API
//!
//! Session control, settings, the read-side channel/guide/log contracts,
//! and the `/ws` event feed. Everything here returns snapshots; live
//! state never leaves the session manager.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use crate::cache::CacheService;
use crate::errors::AppError;
use crate::events::Room;
use crate::models::EndReason;
use crate::utils::human_format;

use super::AppState;

pub async fn streaming_active(State(state): State<AppState>) -> Response {
    let sessions = state.session_manager.get_active().await;
    let capacity = state.session_manager.capacity_metrics().await;
    let bandwidth = state.session_manager.bandwidth_stats().await;
    Json(serde_json::json!({
        "sessions": sessions,
        "capacity": capacity,
        "bandwidth": {
            "totalCurrentBitrate": bandwidth.total_current_bitrate,
            "totalBytesTransferred": bandwidth.total_bytes_transferred,
        },
        "summary": {
            "activeSessions": sessions.len(),
            "totalBytes": human_format::format_bytes(bandwidth.total_bytes_transferred),
            "totalBitrate": human_format::format_bitrate(bandwidth.total_current_bitrate),
        },
    }))
    .into_response()
}

pub async fn streaming_capacity(State(state): State<AppState>) -> Response {
    Json(state.session_manager.capacity_metrics().await).into_response()
}

pub async fn streaming_bandwidth(State(state): State<AppState>) -> Response {
    Json(state.session_manager.bandwidth_stats().await).into_response()
}

pub async fn streaming_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let capacity = state.session_manager.capacity_metrics().await;
    let bandwidth = state.session_manager.bandwidth_stats().await;
    let total_sessions = state.session_history.count().await?;
    Ok(Json(serde_json::json!({
        "capacity": capacity,
        "bandwidth": bandwidth,
        "history": { "totalSessions": total_sessions },
        "uptimeMs": state.started_at.elapsed().as_millis() as u64,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn streaming_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);
    let entries = state.session_history.history(limit, offset).await?;
    let total = state.session_history.count().await?;
    Ok(Json(serde_json::json!({
        "sessions": entries,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
    .into_response())
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state
        .session_manager
        .end(&session_id, EndReason::ManualTermination)
        .await
    {
        Some(snapshot) => Json(serde_json::json!({
            "terminated": true,
            "session": snapshot,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "no such active session").into_response(),
    }
}

pub async fn terminate_client_sessions(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    let ended = state
        .session_manager
        .end_for_client(&client_id, EndReason::Forced)
        .await;
    Json(serde_json::json!({ "terminated": ended })).into_response()
}

pub async fn cleanup_sessions(State(state): State<AppState>) -> Response {
    let ended = state
        .session_manager
        .cleanup_idle(Duration::from_secs(3600), EndReason::CleanupStale)
        .await;
    Json(serde_json::json!({ "cleaned": ended })).into_response()
}

pub async fn get_settings(State(state): State<AppState>) -> Response {
    let settings = state.settings.load().await;
    Json(serde_json::to_value(settings.as_ref()).unwrap_or_default()).into_response()
}

pub async fn put_settings(
    State(state): State<AppState>,
    Json(partial): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let settings = state.settings.update(partial).await?;
    Ok(Json(serde_json::to_value(settings.as_ref()).unwrap_or_default()).into_response())
}

#[derive(Deserialize, Default)]
pub struct ResetRequest {
    category: Option<String>,
}

pub async fn reset_settings(
    State(state): State<AppState>,
    body: Option<Json<ResetRequest>>,
) -> Result<Response, AppError> {
    let category = body.and_then(|Json(r)| r.category);
    let settings = state.settings.reset(category.as_deref()).await?;
    Ok(Json(serde_json::to_value(settings.as_ref()).unwrap_or_default()).into_response())
}

pub async fn list_channels(State(state): State<AppState>) -> Result<Response, AppError> {
    let channels = state.channels.list().await?;
    let mut out = Vec::with_capacity(channels.len());
    for channel in channels {
        let stream_count = state.streams.count_for_channel(&channel.id).await?;
        let mut value = serde_json::to_value(&channel).unwrap_or_default();
        value["streamCount"] = serde_json::json!(stream_count);
        out.push(value);
    }
    Ok(Json(serde_json::Value::Array(out)).into_response())
}

#[derive(Deserialize)]
pub struct GuideQuery {
    #[serde(default = "default_guide_hours")]
    hours: i64,
}

fn default_guide_hours() -> i64 {
    12
}

pub async fn channel_guide(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<GuideQuery>,
) -> Result<Response, AppError> {
    let channel = state
        .channels
        .get(&channel_id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource: "channel".into(),
            id: channel_id.clone(),
        })?;

    let cache_key = CacheService::epg_key(&channel.id);
    if let Some(cached) = state.cache.get_json::<serde_json::Value>(&cache_key).await {
        return Ok(Json(cached).into_response());
    }

    let start = chrono::Utc::now();
    let end = start + chrono::Duration::hours(query.hours.clamp(1, 168));
    let programs = state.epg.programs_for_channel(&channel, start, end).await?;
    let settings = state.settings.load().await;
    let body = serde_json::json!({
        "channel": channel,
        "programs": programs,
        "localizedStart": settings.localization.format_timestamp(start),
    });
    state
        .cache
        .set_json(&cache_key, &body, Some(crate::cache::EPG_TTL))
        .await;
    Ok(Json(body).into_response())
}

#[derive(Deserialize)]
pub struct LogsQuery {
    level: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

pub async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, AppError> {
    let entries = state
        .logs
        .recent(
            query.level.as_deref(),
            query.limit.clamp(1, 1000),
            query.offset.max(0),
        )
        .await?;
    Ok(Json(serde_json::json!({ "logs": entries })).into_response())
}

#[derive(Deserialize)]
pub struct WsQuery {
    /// Comma-separated rooms; all rooms when absent.
    rooms: Option<String>,
}

pub async fn websocket(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let rooms: Option<Vec<Room>> = query.rooms.map(|raw| {
        raw.split(',')
            .filter_map(|name| match name.trim() {
                "metrics" => Some(Room::Metrics),
                "settings" => Some(Room::Settings),
                "streams" => Some(Room::Streams),
                _ => None,
            })
            .collect()
    });
    upgrade.on_upgrade(move |socket| forward_events(socket, state, rooms))
}

async fn forward_events(mut socket: WebSocket, state: AppState, rooms: Option<Vec<Room>>) {
    let mut rx = state.events.subscribe();
    debug!("Event subscriber connected ({} total)", state.events.subscriber_count());
    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    // lagged subscribers skip ahead; they reconcile via the APIs
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if let Some(rooms) = &rooms {
                    if !rooms.contains(&event.room) {
                        continue;
                    }
                }
                let Ok(frame) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("Event subscriber disconnected");
}
