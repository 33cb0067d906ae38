//! Stream session manager
//!
//! Sole owner of all live session state. Every mutation happens under one
//! write lock over the session tables; every query hands out snapshot
//! copies, never live references. Each session carries a cancellation
//! token: ending the session cancels the token, and whichever task is
//! pumping bytes for it observes the cancellation, kills its encoder and
//! returns.
//!
//! Three background loops: a 1 s inactivity sweep (rolling per-session
//! timeout, reset by every delivered byte), a 5 min stale sweep for
//! sessions older than an hour, and a 2 s bandwidth broadcast feeding the
//! operator dashboards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::sessions::FinalStats;
use crate::database::SessionRepository;
use crate::errors::AdmissionError;
use crate::events::{names, EventBus, Room};
use crate::models::{
    CapacityMetrics, CapacityStatus, EndReason, SessionDescriptor, SessionSnapshot, SessionState,
    StreamKind, StreamPhase,
};
use crate::settings::{Settings, SettingsChange};
use crate::utils::human_format;

/// Bandwidth samples older than this fall out of the ring.
pub const BANDWIDTH_WINDOW: Duration = Duration::from_secs(30);
/// Sessions older than this are ended by the stale sweep.
pub const STALE_AGE: Duration = Duration::from_secs(3600);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const INACTIVITY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const BANDWIDTH_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity policy, derived from settings and refreshed on change.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_concurrent: usize,
    pub per_channel: usize,
    pub timeout: Duration,
}

impl SessionLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent: settings.streaming.max_concurrent_streams,
            per_channel: settings.streaming.max_sessions_per_channel,
            timeout: Duration::from_millis(settings.streaming.stream_timeout),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// What the proxy knows before admission; the manager mints the id.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub stream_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_number: i64,
    pub client_addr: String,
    pub client_fingerprint: String,
    pub user_agent: Option<String>,
    pub stream_url: String,
    pub kind: StreamKind,
}

/// Handed back to the proxy on admission.
#[derive(Debug)]
pub struct StartedSession {
    pub descriptor: SessionDescriptor,
    /// Cancelled when the manager ends the session from outside the
    /// request task (timeout, stale sweep, operator termination).
    pub cancel: CancellationToken,
}

struct ActiveSession {
    descriptor: SessionDescriptor,
    state: SessionState,
    phase: StreamPhase,
    started_at: DateTime<Utc>,
    started_mono: Instant,
    last_update: DateTime<Utc>,
    last_activity: Instant,
    bytes_transferred: u64,
    current_bitrate: u64,
    peak_bitrate: u64,
    error_count: u32,
    samples: VecDeque<(Instant, u64)>,
    cancel: CancellationToken,
}

impl ActiveSession {
    fn average_bitrate(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().map(|(_, bitrate)| bitrate).sum();
        sum / self.samples.len() as u64
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.descriptor.session_id.clone(),
            stream_id: self.descriptor.stream_id.clone(),
            channel_id: self.descriptor.channel_id.clone(),
            channel_name: self.descriptor.channel_name.clone(),
            channel_number: self.descriptor.channel_number,
            client_addr: self.descriptor.client_addr.clone(),
            client_fingerprint: self.descriptor.client_fingerprint.clone(),
            user_agent: self.descriptor.user_agent.clone(),
            stream_url: self.descriptor.stream_url.clone(),
            kind: self.descriptor.kind,
            state: self.state,
            phase: self.phase,
            started_at: self.started_at,
            last_update: self.last_update,
            bytes_transferred: self.bytes_transferred,
            current_bitrate: self.current_bitrate,
            average_bitrate: self.average_bitrate(),
            peak_bitrate: self.peak_bitrate,
            error_count: self.error_count,
            duration_ms: self.started_mono.elapsed().as_millis() as u64,
        }
    }

    fn final_stats(&self) -> FinalStats {
        FinalStats {
            bytes_transferred: self.bytes_transferred,
            average_bitrate: self.average_bitrate(),
            peak_bitrate: self.peak_bitrate,
            error_count: self.error_count,
        }
    }
}

#[derive(Default)]
struct SessionTables {
    active: HashMap<String, ActiveSession>,
    by_channel: HashMap<String, HashSet<String>>,
    /// `(fingerprint|streamId)` → session id, for the duplicate rule.
    by_client: HashMap<String, String>,
}

impl SessionTables {
    fn client_key(fingerprint: &str, stream_id: &str) -> String {
        format!("{fingerprint}|{stream_id}")
    }

    fn insert(&mut self, session: ActiveSession) {
        let id = session.descriptor.session_id.clone();
        self.by_channel
            .entry(session.descriptor.channel_id.clone())
            .or_default()
            .insert(id.clone());
        self.by_client.insert(
            Self::client_key(
                &session.descriptor.client_fingerprint,
                &session.descriptor.stream_id,
            ),
            id.clone(),
        );
        self.active.insert(id, session);
    }

    fn remove(&mut self, session_id: &str) -> Option<ActiveSession> {
        let session = self.active.remove(session_id)?;
        if let Some(set) = self.by_channel.get_mut(&session.descriptor.channel_id) {
            set.remove(session_id);
            if set.is_empty() {
                self.by_channel.remove(&session.descriptor.channel_id);
            }
        }
        let key = Self::client_key(
            &session.descriptor.client_fingerprint,
            &session.descriptor.stream_id,
        );
        if self.by_client.get(&key).is_some_and(|id| id == session_id) {
            self.by_client.remove(&key);
        }
        Some(session)
    }
}

/// Per-session counter deltas from the byte pump.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionUpdate {
    pub bytes_delta: u64,
    pub current_bitrate: Option<u64>,
    pub error_delta: u32,
}

/// Aggregate bandwidth view for `/api/streaming/bandwidth`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthStats {
    pub session_count: usize,
    pub total_current_bitrate: u64,
    pub total_bytes_transferred: u64,
    pub sessions: Vec<SessionSnapshot>,
}

pub struct SessionManager {
    tables: RwLock<SessionTables>,
    limits: RwLock<SessionLimits>,
    repo: SessionRepository,
    events: EventBus,
    accepting: AtomicBool,
}

impl SessionManager {
    pub fn new(repo: SessionRepository, events: EventBus, limits: SessionLimits) -> Self {
        Self {
            tables: RwLock::new(SessionTables::default()),
            limits: RwLock::new(limits),
            repo,
            events,
            accepting: AtomicBool::new(true),
        }
    }

    pub async fn limits(&self) -> SessionLimits {
        self.limits.read().await.clone()
    }

    pub async fn set_limits(&self, limits: SessionLimits) {
        *self.limits.write().await = limits;
        self.events.publish(
            Room::Metrics,
            names::METRICS_UPDATE,
            serde_json::json!({ "capacity": self.capacity_metrics().await }),
        );
    }

    /// Admission: duplicate-client takeover first, then the global and
    /// per-channel ceilings, then id allocation.
    pub async fn start(&self, request: SessionRequest) -> Result<StartedSession, AdmissionError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(AdmissionError::ShuttingDown);
        }

        let limits = self.limits().await;
        let mut tables = self.tables.write().await;

        // duplicate rule: at most one active session per (fingerprint,
        // stream); the old one makes way for the new request
        let client_key =
            SessionTables::client_key(&request.client_fingerprint, &request.stream_id);
        let existing_id = tables.by_client.get(&client_key).cloned();
        let displaced = existing_id.and_then(|id| tables.remove(&id));

        if tables.active.len() >= limits.max_concurrent {
            // the new request failed, the displaced session stays
            if let Some(displaced) = displaced {
                tables.insert(displaced);
            }
            return Err(AdmissionError::AtCapacity {
                active: tables.active.len(),
                max: limits.max_concurrent,
            });
        }

        let channel_active = tables
            .by_channel
            .get(&request.channel_id)
            .map(HashSet::len)
            .unwrap_or(0);
        if channel_active >= limits.per_channel {
            if let Some(displaced) = displaced {
                tables.insert(displaced);
            }
            return Err(AdmissionError::ChannelAtCapacity {
                channel_id: request.channel_id.clone(),
                active: channel_active,
                max: limits.per_channel,
            });
        }

        let session_id = format!(
            "{}_{}_{}",
            request.stream_id,
            request.client_fingerprint,
            Utc::now().timestamp_millis()
        );
        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            stream_id: request.stream_id.clone(),
            channel_id: request.channel_id.clone(),
            channel_name: request.channel_name.clone(),
            channel_number: request.channel_number,
            client_addr: request.client_addr.clone(),
            client_fingerprint: request.client_fingerprint.clone(),
            user_agent: request.user_agent.clone(),
            stream_url: request.stream_url.clone(),
            kind: request.kind,
        };
        let cancel = CancellationToken::new();
        let session = ActiveSession {
            descriptor: descriptor.clone(),
            state: SessionState::Admitted,
            phase: StreamPhase::Initializing,
            started_at: Utc::now(),
            started_mono: Instant::now(),
            last_update: Utc::now(),
            last_activity: Instant::now(),
            bytes_transferred: 0,
            current_bitrate: 0,
            peak_bitrate: 0,
            error_count: 0,
            samples: VecDeque::new(),
            cancel: cancel.clone(),
        };
        let snapshot = session.snapshot();
        tables.insert(session);
        drop(tables);

        if let Some(displaced) = displaced {
            let reason = reconnect_reason(request.user_agent.as_deref());
            self.finish_removed(displaced, reason).await;
        }

        if let Err(e) = self.repo.insert_started(&descriptor, Utc::now()).await {
            warn!("Session history insert failed: {e}");
        }
        self.events.publish(
            Room::Streams,
            names::SESSION_STARTED,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        info!(
            "Session {} started: channel {} ({}) for {}",
            descriptor.session_id,
            descriptor.channel_name,
            descriptor.channel_number,
            descriptor.client_addr
        );
        Ok(StartedSession { descriptor, cancel })
    }

    /// Counter updates from the byte pump. Delivered bytes reset the
    /// inactivity timer; `bytesTransferred` only ever grows.
    pub async fn update(&self, session_id: &str, update: SessionUpdate) {
        let mut tables = self.tables.write().await;
        let Some(session) = tables.active.get_mut(session_id) else {
            return;
        };
        session.bytes_transferred += update.bytes_delta;
        session.error_count += update.error_delta;
        session.last_update = Utc::now();
        if update.bytes_delta > 0 {
            session.last_activity = Instant::now();
            if session.state == SessionState::Admitted {
                session.state = SessionState::Streaming;
                // progressive sessions report their own phases; only the
                // plain pipe path infers Streaming from first bytes
                if session.phase == StreamPhase::Initializing {
                    session.phase = StreamPhase::Streaming;
                }
            }
        }
        if let Some(bitrate) = update.current_bitrate {
            session.current_bitrate = bitrate;
            session.peak_bitrate = session.peak_bitrate.max(bitrate);
            let now = Instant::now();
            session.samples.push_back((now, bitrate));
            while session
                .samples
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > BANDWIDTH_WINDOW)
            {
                session.samples.pop_front();
            }
        }
    }

    /// Progressive-handler phase reporting.
    pub async fn set_phase(&self, session_id: &str, phase: StreamPhase) {
        let mut tables = self.tables.write().await;
        if let Some(session) = tables.active.get_mut(session_id) {
            session.phase = phase;
            session.last_update = Utc::now();
        }
    }

    /// End one session: remove it from the tables, cancel its token,
    /// finalize history and emit `session:ended`.
    pub async fn end(&self, session_id: &str, reason: EndReason) -> Option<SessionSnapshot> {
        let removed = self.tables.write().await.remove(session_id)?;
        Some(self.finish_removed(removed, reason).await)
    }

    async fn finish_removed(
        &self,
        mut session: ActiveSession,
        reason: EndReason,
    ) -> SessionSnapshot {
        session.state = SessionState::Ended;
        session.phase = match reason {
            EndReason::Normal => StreamPhase::Completed,
            _ => StreamPhase::Error,
        };
        session.cancel.cancel();
        let snapshot = session.snapshot();

        if let Err(e) = self
            .repo
            .finalize(
                &snapshot.session_id,
                Utc::now(),
                reason,
                session.final_stats(),
            )
            .await
        {
            warn!("Session history finalize failed: {e}");
        }

        self.events.publish(
            Room::Streams,
            names::SESSION_ENDED,
            serde_json::json!({
                "session": snapshot,
                "reason": reason,
            }),
        );
        info!(
            "Session {} ended ({reason}): {} in {}, avg {}",
            snapshot.session_id,
            human_format::format_bytes(snapshot.bytes_transferred),
            human_format::format_duration(snapshot.duration_ms),
            human_format::format_bitrate(snapshot.average_bitrate),
        );
        snapshot
    }

    /// End every active session (graceful shutdown path stops admissions
    /// first).
    pub async fn end_all(&self, reason: EndReason) -> usize {
        let ids: Vec<String> = {
            let tables = self.tables.read().await;
            tables.active.keys().cloned().collect()
        };
        let mut ended = 0;
        for id in ids {
            if self.end(&id, reason).await.is_some() {
                ended += 1;
            }
        }
        ended
    }

    /// Terminate all sessions owned by a client (fingerprint or address).
    pub async fn end_for_client(&self, client_id: &str, reason: EndReason) -> usize {
        let ids: Vec<String> = {
            let tables = self.tables.read().await;
            tables
                .active
                .values()
                .filter(|s| {
                    s.descriptor.client_fingerprint == client_id
                        || s.descriptor.client_addr == client_id
                })
                .map(|s| s.descriptor.session_id.clone())
                .collect()
        };
        let mut ended = 0;
        for id in ids {
            if self.end(&id, reason).await.is_some() {
                ended += 1;
            }
        }
        ended
    }

    /// Terminate sessions idle longer than `max_idle`.
    pub async fn cleanup_idle(&self, max_idle: Duration, reason: EndReason) -> usize {
        let ids: Vec<String> = {
            let tables = self.tables.read().await;
            tables
                .active
                .values()
                .filter(|s| s.last_activity.elapsed() > max_idle)
                .map(|s| s.descriptor.session_id.clone())
                .collect()
        };
        let mut ended = 0;
        for id in ids {
            if self.end(&id, reason).await.is_some() {
                ended += 1;
            }
        }
        ended
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    pub async fn shutdown(&self) -> usize {
        self.stop_accepting();
        self.end_all(EndReason::Shutdown).await
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let tables = self.tables.read().await;
        tables.active.get(session_id).map(ActiveSession::snapshot)
    }

    pub async fn get_active(&self) -> Vec<SessionSnapshot> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<_> = tables.active.values().map(ActiveSession::snapshot).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub async fn get_active_by_client_and_stream(
        &self,
        fingerprint: &str,
        stream_id: &str,
    ) -> Option<SessionSnapshot> {
        let tables = self.tables.read().await;
        let id = tables
            .by_client
            .get(&SessionTables::client_key(fingerprint, stream_id))?;
        tables.active.get(id).map(ActiveSession::snapshot)
    }

    pub async fn active_count(&self) -> usize {
        self.tables.read().await.active.len()
    }

    pub async fn capacity_metrics(&self) -> CapacityMetrics {
        let active = self.active_count().await;
        let max = self.limits().await.max_concurrent;
        let utilization = if max == 0 {
            0.0
        } else {
            (active as f64 / max as f64) * 100.0
        };
        CapacityMetrics {
            total_active_streams: active,
            max_concurrent_streams: max,
            utilization_percentage: (utilization * 10.0).round() / 10.0,
            available_streams: max.saturating_sub(active),
            status: CapacityStatus::from_utilization(utilization),
        }
    }

    pub async fn bandwidth_stats(&self) -> BandwidthStats {
        let sessions = self.get_active().await;
        BandwidthStats {
            session_count: sessions.len(),
            total_current_bitrate: sessions.iter().map(|s| s.current_bitrate).sum(),
            total_bytes_transferred: sessions.iter().map(|s| s.bytes_transferred).sum(),
            sessions,
        }
    }

    /// Spawn the inactivity, stale and bandwidth-broadcast loops.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(INACTIVITY_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let timeout = manager.limits().await.timeout;
                let expired: Vec<String> = {
                    let tables = manager.tables.read().await;
                    tables
                        .active
                        .values()
                        .filter(|s| s.last_activity.elapsed() > timeout)
                        .map(|s| s.descriptor.session_id.clone())
                        .collect()
                };
                for id in expired {
                    debug!("Session {id} hit the inactivity timeout");
                    manager.end(&id, EndReason::Timeout).await;
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STALE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let stale: Vec<String> = {
                    let tables = manager.tables.read().await;
                    tables
                        .active
                        .values()
                        .filter(|s| s.started_mono.elapsed() > STALE_AGE)
                        .map(|s| s.descriptor.session_id.clone())
                        .collect()
                };
                for id in stale {
                    manager.end(&id, EndReason::Stale).await;
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BANDWIDTH_BROADCAST_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if manager.events.subscriber_count() == 0 {
                    continue;
                }
                let bandwidth = manager.bandwidth_stats().await;
                let capacity = manager.capacity_metrics().await;
                manager.events.publish(
                    Room::Streams,
                    names::BANDWIDTH_UPDATE,
                    serde_json::to_value(&bandwidth).unwrap_or_default(),
                );
                manager.events.publish(
                    Room::Metrics,
                    names::MONITORING_UPDATE,
                    serde_json::json!({
                        "sessions": bandwidth.sessions,
                        "capacity": capacity,
                        "bandwidth": {
                            "totalCurrentBitrate": bandwidth.total_current_bitrate,
                            "totalBytesTransferred": bandwidth.total_bytes_transferred,
                        },
                        "summary": {
                            "activeSessions": bandwidth.session_count,
                        },
                    }),
                );
            }
        });
    }

    /// React to settings changes: capacity and timeout apply live.
    pub fn watch_settings(
        self: &Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<SettingsChange>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok(change) = rx.recv().await {
                let touches_streaming = change
                    .changed
                    .iter()
                    .any(|path| path.starts_with("streaming.") || path == "*");
                if touches_streaming {
                    manager
                        .set_limits(SessionLimits::from_settings(&change.settings))
                        .await;
                }
            }
        });
    }
}

fn reconnect_reason(user_agent: Option<&str>) -> EndReason {
    match user_agent {
        Some(ua) if ua.to_ascii_lowercase().contains("plex") => EndReason::PlexReconnect,
        _ => EndReason::ClientReconnect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_database;

    async fn manager_with(limits: SessionLimits) -> (Arc<SessionManager>, tempfile::TempDir) {
        let (db, dir) = test_database().await;
        let repo = SessionRepository::new(db.pool().clone());
        (
            Arc::new(SessionManager::new(repo, EventBus::default(), limits)),
            dir,
        )
    }

    fn request(client: &str, stream: &str, channel: &str) -> SessionRequest {
        SessionRequest {
            stream_id: stream.to_string(),
            channel_id: channel.to_string(),
            channel_name: format!("Channel {channel}"),
            channel_number: 100,
            client_addr: "10.0.0.20".to_string(),
            client_fingerprint: client.to_string(),
            user_agent: Some("Plex/4.15".to_string()),
            stream_url: "https://origin.example/live.m3u8".to_string(),
            kind: StreamKind::Hls,
        }
    }

    #[tokio::test]
    async fn capacity_rejection_past_max_concurrent() {
        let (manager, _dir) = manager_with(SessionLimits {
            max_concurrent: 2,
            per_channel: 3,
            timeout: Duration::from_secs(30),
        })
        .await;

        manager.start(request("f1", "s100", "ch100")).await.unwrap();
        manager.start(request("f2", "s100", "ch100")).await.unwrap();

        let err = manager
            .start(request("f3", "s100", "ch100"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::AtCapacity { .. }));
        assert!(err.to_string().contains("Maximum concurrent streams reached"));
        assert_eq!(manager.active_count().await, 2);
    }

    #[tokio::test]
    async fn per_channel_ceiling_enforced() {
        let (manager, _dir) = manager_with(SessionLimits {
            max_concurrent: 10,
            per_channel: 3,
            timeout: Duration::from_secs(30),
        })
        .await;

        for i in 0..3 {
            manager
                .start(request(&format!("f{i}"), "s1", "ch5"))
                .await
                .unwrap();
        }
        let err = manager.start(request("f9", "s1", "ch5")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::ChannelAtCapacity { .. }));

        // other channels unaffected
        manager.start(request("f9", "s2", "ch6")).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_client_is_displaced_not_stacked() {
        let (manager, _dir) = manager_with(SessionLimits::default()).await;

        let first = manager.start(request("f1", "s5", "ch5")).await.unwrap();
        let second = manager.start(request("f1", "s5", "ch5")).await.unwrap();
        assert_ne!(
            first.descriptor.session_id,
            second.descriptor.session_id
        );

        // old session is gone and its token cancelled
        assert!(first.cancel.is_cancelled());
        let active = manager.get_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, second.descriptor.session_id);

        let by_pair = manager
            .get_active_by_client_and_stream("f1", "s5")
            .await
            .unwrap();
        assert_eq!(by_pair.session_id, second.descriptor.session_id);
    }

    #[tokio::test]
    async fn bytes_are_monotonic_and_drive_state() {
        let (manager, _dir) = manager_with(SessionLimits::default()).await;
        let started = manager.start(request("f1", "s1", "ch1")).await.unwrap();
        let id = &started.descriptor.session_id;

        manager
            .update(
                id,
                SessionUpdate {
                    bytes_delta: 1000,
                    current_bitrate: Some(2_000_000),
                    error_delta: 0,
                },
            )
            .await;
        manager
            .update(
                id,
                SessionUpdate {
                    bytes_delta: 500,
                    current_bitrate: Some(1_000_000),
                    error_delta: 1,
                },
            )
            .await;

        let snapshot = manager.get(id).await.unwrap();
        assert_eq!(snapshot.bytes_transferred, 1500);
        assert_eq!(snapshot.state, SessionState::Streaming);
        assert_eq!(snapshot.current_bitrate, 1_000_000);
        assert_eq!(snapshot.peak_bitrate, 2_000_000);
        assert_eq!(snapshot.average_bitrate, 1_500_000);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn end_reports_snapshot_and_clears_tables() {
        let (manager, _dir) = manager_with(SessionLimits::default()).await;
        let started = manager.start(request("f1", "s1", "ch1")).await.unwrap();
        let id = started.descriptor.session_id.clone();

        let snapshot = manager.end(&id, EndReason::ClientDisconnect).await.unwrap();
        assert_eq!(snapshot.session_id, id);
        assert!(started.cancel.is_cancelled());
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.get(&id).await.is_none());
        // idempotent
        assert!(manager.end(&id, EndReason::ClientDisconnect).await.is_none());
    }

    #[tokio::test]
    async fn capacity_metrics_bands() {
        let (manager, _dir) = manager_with(SessionLimits {
            max_concurrent: 4,
            per_channel: 4,
            timeout: Duration::from_secs(30),
        })
        .await;

        for i in 0..3 {
            manager
                .start(request(&format!("f{i}"), &format!("s{i}"), "ch1"))
                .await
                .unwrap();
        }
        let metrics = manager.capacity_metrics().await;
        assert_eq!(metrics.total_active_streams, 3);
        assert_eq!(metrics.available_streams, 1);
        assert_eq!(metrics.utilization_percentage, 75.0);
        assert_eq!(metrics.status, CapacityStatus::Warning);
    }

    #[tokio::test]
    async fn shutdown_stops_admissions_and_ends_everything() {
        let (manager, _dir) = manager_with(SessionLimits::default()).await;
        manager.start(request("f1", "s1", "ch1")).await.unwrap();
        manager.start(request("f2", "s2", "ch2")).await.unwrap();

        let ended = manager.shutdown().await;
        assert_eq!(ended, 2);
        assert_eq!(manager.active_count().await, 0);

        let err = manager.start(request("f3", "s3", "ch3")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::ShuttingDown));
    }

    #[tokio::test]
    async fn session_events_reach_the_bus() {
        let (db, _dir) = test_database().await;
        let repo = SessionRepository::new(db.pool().clone());
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let manager = Arc::new(SessionManager::new(repo, bus, SessionLimits::default()));

        let started = manager.start(request("f1", "s1", "ch1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, names::SESSION_STARTED);

        manager
            .end(&started.descriptor.session_id, EndReason::ManualTermination)
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, names::SESSION_ENDED);
        assert_eq!(event.data["reason"], "manual_termination");
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_sweep_times_out_silent_sessions() {
        let (manager, _dir) = manager_with(SessionLimits {
            max_concurrent: 5,
            per_channel: 5,
            timeout: Duration::from_secs(5),
        })
        .await;
        manager.start_background_tasks();

        let started = manager.start(request("f1", "s1", "ch1")).await.unwrap();
        let id = started.descriptor.session_id.clone();

        // bytes keep it alive
        tokio::time::advance(Duration::from_secs(3)).await;
        manager
            .update(
                &id,
                SessionUpdate {
                    bytes_delta: 188,
                    current_bitrate: None,
                    error_delta: 0,
                },
            )
            .await;
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(manager.get(&id).await.is_some());

        // silence past the timeout ends it
        tokio::time::advance(Duration::from_secs(6)).await;
        // let the sweep run
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(manager.get(&id).await.is_none());
        assert!(started.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn session_history_rows_follow_the_lifecycle() {
        let (db, _dir) = test_database().await;
        let repo = SessionRepository::new(db.pool().clone());
        let manager = Arc::new(SessionManager::new(
            repo.clone(),
            EventBus::default(),
            SessionLimits::default(),
        ));

        let started = manager.start(request("f1", "s1", "ch1")).await.unwrap();
        manager
            .update(
                &started.descriptor.session_id,
                SessionUpdate {
                    bytes_delta: 4096,
                    current_bitrate: Some(1_000_000),
                    error_delta: 0,
                },
            )
            .await;
        manager
            .end(&started.descriptor.session_id, EndReason::Normal)
            .await;

        let history = repo.history(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].end_reason.as_deref(), Some("normal"));
        assert_eq!(history[0].bytes_transferred, 4096);
    }

    #[test]
    fn plex_user_agents_get_the_plex_reason() {
        assert_eq!(
            reconnect_reason(Some("Plex Media Server/1.40")),
            EndReason::PlexReconnect
        );
        assert_eq!(reconnect_reason(Some("VLC/3.0")), EndReason::ClientReconnect);
        assert_eq!(reconnect_reason(None), EndReason::ClientReconnect);
    }
}
