//! Process configuration
//!
//! Static configuration loaded once at startup: where the database lives,
//! where to bind, which encoder binary to drive. Anything an operator can
//! change at runtime lives in the settings service instead.

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. The parent directory must be
    /// writable; corruption recovery renames damaged files alongside it.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/tuner-bridge.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Optional Redis URL. When unset (or until the connection succeeds)
    /// the in-process backend serves all cache traffic.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to the external encoder binary.
    pub ffmpeg_path: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent presented to origin servers.
    pub user_agent: String,
    /// Seconds before an upstream HEAD/GET is abandoned.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "VLC/3.0.20 LibVLC/3.0.20".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// `TUNER_BRIDGE_*` environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TUNER_BRIDGE_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.encoder.ffmpeg_path, "ffmpeg");
        assert!(config.cache.redis_url.is_none());
        assert!(config.http.user_agent.starts_with("VLC/"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("does-not-exist.toml").unwrap();
        assert_eq!(config.web.host, "0.0.0.0");
        assert_eq!(config.database.path, "data/tuner-bridge.db");
    }
}
