//! Domain models shared across the crate
//!
//! Channels and streams are operator-managed metadata; sessions are the
//! live client-stream bindings owned by the session manager. All API-facing
//! types serialize with camelCase keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A logical TV position with a stable number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub number: i64,
    pub enabled: bool,
    pub logo_url: Option<String>,
    /// Key used to associate the channel with an EPG feed channel id.
    pub epg_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Declared transport kind of a stream source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Hls,
    Dash,
    Rtsp,
    Rtmp,
    Udp,
    Http,
    Mms,
    Srt,
    Ts,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Hls => "hls",
            StreamKind::Dash => "dash",
            StreamKind::Rtsp => "rtsp",
            StreamKind::Rtmp => "rtmp",
            StreamKind::Udp => "udp",
            StreamKind::Http => "http",
            StreamKind::Mms => "mms",
            StreamKind::Srt => "srt",
            StreamKind::Ts => "ts",
        }
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hls" => Ok(StreamKind::Hls),
            "dash" => Ok(StreamKind::Dash),
            "rtsp" => Ok(StreamKind::Rtsp),
            "rtmp" | "rtmps" => Ok(StreamKind::Rtmp),
            "udp" => Ok(StreamKind::Udp),
            "http" | "https" => Ok(StreamKind::Http),
            "mms" => Ok(StreamKind::Mms),
            "srt" => Ok(StreamKind::Srt),
            "ts" | "mpegts" => Ok(StreamKind::Ts),
            other => Err(format!("unknown stream kind: {other}")),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional HTTP Basic credentials forwarded to the origin server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAuth {
    pub username: String,
    pub password: String,
}

/// A concrete playable source bound to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub url: String,
    pub kind: StreamKind,
    #[serde(default)]
    pub backup_urls: Vec<String>,
    pub auth: Option<StreamAuth>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    pub enabled: bool,
    /// Origins that only tolerate one slow-opening connection get the
    /// progressive keep-alive handler instead of a direct encoder launch.
    pub connection_limited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Admitted,
    Streaming,
    Ended,
}

/// Why a session ended. Recorded in history and carried on `session:ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    ClientDisconnect,
    Timeout,
    Stale,
    ManualTermination,
    ClientReconnect,
    PlexReconnect,
    FfmpegError,
    ProcessClosed,
    Forced,
    CleanupStale,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::ClientDisconnect => "client_disconnect",
            EndReason::Timeout => "timeout",
            EndReason::Stale => "stale",
            EndReason::ManualTermination => "manual_termination",
            EndReason::ClientReconnect => "client_reconnect",
            EndReason::PlexReconnect => "plex_reconnect",
            EndReason::FfmpegError => "ffmpeg_error",
            EndReason::ProcessClosed => "process_closed",
            EndReason::Forced => "forced",
            EndReason::CleanupStale => "cleanup_stale",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the progressive (keep-alive) handler, reported by the stats API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Initializing,
    Resolving,
    StreamResolved,
    StartingFfmpeg,
    Streaming,
    Completed,
    Error,
}

/// Everything the session manager needs to admit and track a new session.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: String,
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

/// Immutable point-in-time copy of one active session, for APIs and events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub stream_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_number: i64,
    pub client_addr: String,
    pub client_fingerprint: String,
    pub user_agent: Option<String>,
    pub stream_url: String,
    pub kind: StreamKind,
    pub state: SessionState,
    pub phase: StreamPhase,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub bytes_transferred: u64,
    /// bits per second
    pub current_bitrate: u64,
    pub average_bitrate: u64,
    pub peak_bitrate: u64,
    pub error_count: u32,
    pub duration_ms: u64,
}

/// One finished session as persisted in `stream_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub stream_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_number: i64,
    pub client_addr: String,
    pub client_fingerprint: String,
    pub user_agent: Option<String>,
    pub stream_url: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub bytes_transferred: i64,
    pub average_bitrate: i64,
    pub peak_bitrate: i64,
    pub error_count: i64,
}

/// Capacity report for the active-streams dashboard and admission logging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityMetrics {
    pub total_active_streams: usize,
    pub max_concurrent_streams: usize,
    pub utilization_percentage: f64,
    pub available_streams: usize,
    pub status: CapacityStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityStatus {
    Normal,
    Warning,
    Critical,
}

impl CapacityStatus {
    /// normal <= 70%, warning <= 90%, critical above that.
    pub fn from_utilization(pct: f64) -> Self {
        if pct > 90.0 {
            CapacityStatus::Critical
        } else if pct > 70.0 {
            CapacityStatus::Warning
        } else {
            CapacityStatus::Normal
        }
    }
}

/// An EPG feed the metadata store knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// A channel identifier advertised by an EPG feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgChannel {
    pub id: String,
    pub source_id: String,
    pub epg_id: String,
    pub display_name: String,
    pub icon_url: Option<String>,
}

/// A time-bounded program entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgProgram {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_kind_round_trips_through_str() {
        for kind in [
            StreamKind::Hls,
            StreamKind::Dash,
            StreamKind::Rtsp,
            StreamKind::Rtmp,
            StreamKind::Udp,
            StreamKind::Http,
            StreamKind::Mms,
            StreamKind::Srt,
            StreamKind::Ts,
        ] {
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
        }
        assert!("carrier-pigeon".parse::<StreamKind>().is_err());
    }

    #[test]
    fn capacity_status_bands() {
        assert_eq!(CapacityStatus::from_utilization(0.0), CapacityStatus::Normal);
        assert_eq!(CapacityStatus::from_utilization(70.0), CapacityStatus::Normal);
        assert_eq!(CapacityStatus::from_utilization(70.1), CapacityStatus::Warning);
        assert_eq!(CapacityStatus::from_utilization(90.0), CapacityStatus::Warning);
        assert_eq!(CapacityStatus::from_utilization(90.1), CapacityStatus::Critical);
    }

    #[test]
    fn end_reason_serializes_snake_case() {
        let json = serde_json::to_string(&EndReason::ClientReconnect).unwrap();
        assert_eq!(json, "\"client_reconnect\"");
    }
}
