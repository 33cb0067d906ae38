//! The typed settings tree and its defaults

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub ssdp: SsdpSettings,
    pub streaming: StreamingSettings,
    pub transcoding: TranscodingSettings,
    pub caching: CachingSettings,
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub compatibility: CompatibilitySettings,
    pub localization: LocalizationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SsdpSettings {
    /// Seconds between periodic NOTIFY announcements.
    pub announce_interval: u64,
    pub multicast_address: String,
    pub device_description: String,
}

impl Default for SsdpSettings {
    fn default() -> Self {
        Self {
            announce_interval: 1800,
            multicast_address: "239.255.255.250".to_string(),
            device_description: "IPTV bridge exposing an HDHomeRun tuner".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingSettings {
    pub max_concurrent_streams: usize,
    /// Per-session inactivity timeout, milliseconds.
    pub stream_timeout: u64,
    pub reconnect_attempts: u32,
    /// Bytes read from encoder stdout per chunk.
    pub buffer_size: usize,
    pub preferred_protocol: String,
    /// Concurrent session ceiling per channel.
    pub max_sessions_per_channel: usize,
    /// When set, the rewrite of single-variant masters picks the variant
    /// directly instead of serving the master. Off: serve the master.
    pub prefer_variant_pick: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 5,
            stream_timeout: 30_000,
            reconnect_attempts: 3,
            buffer_size: 65_536,
            preferred_protocol: "hls".to_string(),
            max_sessions_per_channel: 3,
            prefer_variant_pick: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscodingSettings {
    pub enabled: bool,
    pub hardware_acceleration: bool,
    pub preset: String,
    pub video_codec: String,
    pub audio_codec: String,
    /// Named encoder profiles, free-form.
    pub quality_profiles: serde_json::Value,
    pub default_profile: String,
}

impl Default for TranscodingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hardware_acceleration: false,
            preset: "veryfast".to_string(),
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            quality_profiles: serde_json::json!({
                "original": { "description": "Remux without re-encoding" },
                "high": { "videoBitrate": 8000, "audioBitrate": 192 },
                "medium": { "videoBitrate": 4000, "audioBitrate": 128 },
                "low": { "videoBitrate": 1500, "audioBitrate": 96 },
            }),
            default_profile: "original".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CachingSettings {
    pub enabled: bool,
    /// Default TTL, seconds.
    pub duration: u64,
    pub max_size_mb: u64,
    pub cleanup_interval: u64,
}

impl Default for CachingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: 3600,
            max_size_mb: 256,
            cleanup_interval: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    pub name: String,
    pub id: String,
    pub tuner_count: u32,
    pub firmware: String,
    /// Overrides the advertised base URL when set.
    pub base_url: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: "TunerBridge".to_string(),
            id: "12345678".to_string(),
            tuner_count: 4,
            firmware: "20240401".to_string(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub bind_address: String,
    /// Host Plex and playlist rewrites should reach us on.
    pub advertised_host: String,
    pub streaming_port: u16,
    pub discovery_port: u16,
    pub ipv6: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            streaming_port: 8080,
            discovery_port: 1900,
            ipv6: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompatibilitySettings {
    pub hd_home_run_mode: bool,
    pub plex_pass_required: bool,
    /// Milliseconds Plex is given to reconnect before a dropped session
    /// counts as gone.
    pub grace_period: u64,
    pub channel_logo_fallback: bool,
}

impl Default for CompatibilitySettings {
    fn default() -> Self {
        Self {
            hd_home_run_mode: true,
            plex_pass_required: false,
            grace_period: 10_000,
            channel_logo_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalizationSettings {
    pub timezone: String,
    pub locale: String,
    pub date_format: String,
    pub time_format: String,
    pub first_day_of_week: u8,
}

impl Default for LocalizationSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            date_format: "YYYY-MM-DD".to_string(),
            time_format: "24h".to_string(),
            first_day_of_week: 0,
        }
    }
}

impl LocalizationSettings {
    /// Render a timestamp the way the operator asked for: their timezone,
    /// date order and clock style. Used by guide responses and log views.
    pub fn format_timestamp(&self, at: DateTime<Utc>) -> String {
        let tz: chrono_tz::Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local = at.with_timezone(&tz);
        let date_part = match self.date_format.as_str() {
            "MM/DD/YYYY" => local.format("%m/%d/%Y"),
            "DD/MM/YYYY" => local.format("%d/%m/%Y"),
            "DD.MM.YYYY" => local.format("%d.%m.%Y"),
            _ => local.format("%Y-%m-%d"),
        };
        let time_part = if self.time_format == "12h" {
            local.format("%I:%M:%S %p")
        } else {
            local.format("%H:%M:%S")
        };
        format!("{date_part} {time_part}")
    }
}

impl NetworkSettings {
    /// Base URL clients on the LAN should use to reach the tuner surface.
    pub fn advertised_base(&self) -> String {
        format!("http://{}:{}", self.advertised_host, self.streaming_port)
    }
}

impl Settings {
    /// Base URL for the device descriptor, honoring the operator override.
    pub fn device_base_url(&self) -> String {
        self.device
            .base_url
            .clone()
            .unwrap_or_else(|| self.network.advertised_base())
    }
}
