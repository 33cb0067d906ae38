//! Health endpoints
//!
//! `/health/live` answers whenever the process runs; `/health/ready`
//! gates on the metadata store; `/health` is the full structured report
//! with a 60 s cached system snapshot.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::cache::CacheService;
use crate::models::CapacityStatus;

use super::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemHealth {
    Healthy,
    Degraded,
    Stopped,
    Unhealthy,
}

pub async fn live() -> Response {
    (StatusCode::OK, "OK").into_response()
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if state.database.ping().await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "reason": "metadata store is not responding",
            })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemSnapshot {
    memory_bytes: u64,
    cpu_percent: f32,
}

async fn system_snapshot(state: &AppState) -> SystemSnapshot {
    let key = CacheService::metrics_key();
    if let Some(cached) = state.cache.get_json::<SystemSnapshot>(&key).await {
        return cached;
    }

    let snapshot = {
        let mut system = state.system.write().await;
        system.refresh_all();
        let pid = sysinfo::get_current_pid().ok();
        let process = pid.and_then(|pid| system.process(pid));
        SystemSnapshot {
            memory_bytes: process.map(|p| p.memory()).unwrap_or(0),
            cpu_percent: process.map(|p| p.cpu_usage()).unwrap_or(0.0),
        }
    };
    state
        .cache
        .set_json(&key, &snapshot, Some(crate::cache::METRICS_TTL))
        .await;
    snapshot
}

pub async fn health(State(state): State<AppState>) -> Response {
    let database = if state.database.ping().await {
        SubsystemHealth::Healthy
    } else {
        SubsystemHealth::Unhealthy
    };
    let cache = if state.cache.healthy().await {
        SubsystemHealth::Healthy
    } else {
        SubsystemHealth::Degraded
    };
    let ssdp = if state.ssdp.is_running().await {
        SubsystemHealth::Healthy
    } else {
        SubsystemHealth::Stopped
    };
    let capacity = state.session_manager.capacity_metrics().await;
    let sessions = match capacity.status {
        CapacityStatus::Normal => SubsystemHealth::Healthy,
        CapacityStatus::Warning | CapacityStatus::Critical => SubsystemHealth::Degraded,
    };

    let subsystems = [database, cache, ssdp, sessions];
    let overall = if subsystems.contains(&SubsystemHealth::Unhealthy) {
        SubsystemHealth::Unhealthy
    } else if subsystems.contains(&SubsystemHealth::Degraded) {
        SubsystemHealth::Degraded
    } else {
        SubsystemHealth::Healthy
    };

    let snapshot = system_snapshot(&state).await;
    let status = if overall == SubsystemHealth::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(serde_json::json!({
            "status": overall,
            "uptimeMs": state.started_at.elapsed().as_millis() as u64,
            "version": env!("CARGO_PKG_VERSION"),
            "system": {
                "memoryBytes": snapshot.memory_bytes,
                "cpuPercent": snapshot.cpu_percent,
            },
            "subsystems": {
                "database": database,
                "cache": { "status": cache, "backend": state.cache.backend_name().await },
                "ssdp": ssdp,
                "sessions": { "status": sessions, "capacity": capacity },
            },
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_health_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SubsystemHealth::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&SubsystemHealth::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }
}
