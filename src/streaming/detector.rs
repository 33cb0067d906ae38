//! Stream format detection and URL resolution
//!
//! Classification is cheap-first: path and scheme heuristics answer most
//! URLs without touching the network. Ambiguous http(s) URLs get a HEAD
//! (bounded to 5 redirects), and as a last resort the first KiB of the
//! body is sniffed for playlist/manifest markers.

use reqwest::Client;
use tracing::debug;

use crate::errors::StreamError;
use crate::models::StreamKind;
use crate::utils::url::UrlUtils;

/// Redirect budget for HEAD/GET probes and final-URL resolution.
pub const MAX_REDIRECTS: usize = 5;
/// How much body to pull when sniffing content.
const SNIFF_BYTES: usize = 1024;

/// Classification result: `kind` is `None` when nothing matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedFormat {
    pub kind: Option<StreamKind>,
    pub protocol: String,
}

pub struct FormatDetector {
    client: Client,
}

impl FormatDetector {
    /// `client` should carry the configured User-Agent and a
    /// `Policy::limited(MAX_REDIRECTS)` redirect policy.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Pure heuristics: URL suffix, path markers and scheme.
    pub fn detect_by_path(url: &str) -> Option<StreamKind> {
        let stripped = UrlUtils::strip_query_and_fragment(url).to_ascii_lowercase();

        for (scheme, kind) in [
            ("rtsp://", StreamKind::Rtsp),
            ("rtmp://", StreamKind::Rtmp),
            ("rtmps://", StreamKind::Rtmp),
            ("udp://", StreamKind::Udp),
            ("mms://", StreamKind::Mms),
            ("srt://", StreamKind::Srt),
        ] {
            if stripped.starts_with(scheme) {
                return Some(kind);
            }
        }

        if stripped.ends_with(".m3u8") || stripped.contains("/hls/") {
            return Some(StreamKind::Hls);
        }
        if stripped.ends_with(".mpd") || stripped.contains("/dash/") {
            return Some(StreamKind::Dash);
        }
        if stripped.ends_with(".ts") || stripped.ends_with(".mpegts") || stripped.ends_with(".mts")
        {
            return Some(StreamKind::Ts);
        }
        None
    }

    /// Full classification. Never errors: anything unclassifiable comes
    /// back with `kind: None`.
    pub async fn detect(&self, url: &str) -> DetectedFormat {
        let protocol = UrlUtils::parse_and_validate(url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        if let Some(kind) = Self::detect_by_path(url) {
            return DetectedFormat {
                kind: Some(kind),
                protocol,
            };
        }
        if protocol != "http" && protocol != "https" {
            return DetectedFormat {
                kind: None,
                protocol,
            };
        }

        if let Some(kind) = self.detect_by_head(url).await {
            return DetectedFormat {
                kind: Some(kind),
                protocol,
            };
        }
        let kind = self.detect_by_sniff(url).await;
        DetectedFormat { kind, protocol }
    }

    async fn detect_by_head(&self, url: &str) -> Option<StreamKind> {
        let response = match self.client.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("HEAD probe failed for {url}: {e}");
                return None;
            }
        };
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)?
            .to_str()
            .ok()?
            .to_ascii_lowercase();

        if content_type.contains("application/vnd.apple.mpegurl")
            || content_type.contains("application/x-mpegurl")
        {
            Some(StreamKind::Hls)
        } else if content_type.contains("application/dash+xml") {
            Some(StreamKind::Dash)
        } else if content_type.starts_with("video/")
            || content_type.contains("application/octet-stream")
        {
            Some(StreamKind::Http)
        } else {
            None
        }
    }

    async fn detect_by_sniff(&self, url: &str) -> Option<StreamKind> {
        let mut response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("GET sniff failed for {url}: {e}");
                return None;
            }
        };
        let mut head = Vec::with_capacity(SNIFF_BYTES);
        while head.len() < SNIFF_BYTES {
            match response.chunk().await {
                Ok(Some(chunk)) => head.extend_from_slice(&chunk),
                _ => break,
            }
        }
        head.truncate(SNIFF_BYTES);
        let text = String::from_utf8_lossy(&head);
        Self::sniff_text(&text)
    }

    /// Marker scan over the first KiB of a body.
    pub fn sniff_text(text: &str) -> Option<StreamKind> {
        if text.contains("#EXTM3U") || text.contains("#EXT-X-") {
            Some(StreamKind::Hls)
        } else if text.contains("<MPD") || text.contains("urn:mpeg:dash") {
            Some(StreamKind::Dash)
        } else {
            None
        }
    }

    /// Follow redirects (up to the budget) and return the final absolute
    /// URL. Used to build sub-file URLs for HLS media playlists.
    pub async fn resolve_final(&self, url: &str) -> Result<String, StreamError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_redirect() {
                    StreamError::TooManyRedirects {
                        url: url.to_string(),
                        limit: MAX_REDIRECTS,
                    }
                } else {
                    StreamError::ResolutionFailed {
                        message: e.to_string(),
                    }
                }
            })?;
        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(StreamError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response.url().to_string())
    }
}

/// A master playlist references other playlists; a media playlist
/// references segments only.
pub fn is_master_playlist(text: &str) -> bool {
    if text.contains("#EXT-X-STREAM-INF") {
        return true;
    }
    text.lines().any(|line| {
        let line = line.trim();
        !line.starts_with('#') && UrlUtils::strip_query_and_fragment(line).ends_with(".m3u8")
    })
}

/// Rewrite relative `.m3u8`/`.ts` references in a master playlist so the
/// client's sub-requests come back through us. Absolute URLs pass through
/// untouched, which also makes a second pass a no-op.
pub fn rewrite_master_playlist(
    text: &str,
    advertised_host: &str,
    streaming_port: u16,
    channel_id: &str,
) -> String {
    let prefix = format!("http://{advertised_host}:{streaming_port}/stream/{channel_id}/");
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            // variant tags can carry URI="..." attributes (audio renditions,
            // i-frame playlists); rewrite those too
            out.push_str(&rewrite_uri_attribute(line, &prefix));
        } else if is_rewritable_reference(trimmed) {
            out.push_str(&prefix);
            out.push_str(trimmed.trim_start_matches('/'));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn is_rewritable_reference(line: &str) -> bool {
    if line.is_empty() || line.starts_with("http://") || line.starts_with("https://") {
        return false;
    }
    let stripped = UrlUtils::strip_query_and_fragment(line);
    stripped.ends_with(".m3u8") || stripped.ends_with(".ts")
}

fn rewrite_uri_attribute(line: &str, prefix: &str) -> String {
    let Some(start) = line.find("URI=\"") else {
        return line.to_string();
    };
    let value_start = start + "URI=\"".len();
    let Some(rel_end) = line[value_start..].find('"') else {
        return line.to_string();
    };
    let value = &line[value_start..value_start + rel_end];
    if !is_rewritable_reference(value) {
        return line.to_string();
    }
    format!(
        "{}{}{}{}",
        &line[..value_start],
        prefix,
        value.trim_start_matches('/'),
        &line[value_start + rel_end..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_heuristics_cover_the_table() {
        let cases = [
            ("https://a/live/index.m3u8", Some(StreamKind::Hls)),
            ("https://a/hls/chan?auth=1", Some(StreamKind::Hls)),
            ("https://a/manifest.mpd", Some(StreamKind::Dash)),
            ("https://a/dash/chan", Some(StreamKind::Dash)),
            ("http://a/feed.ts", Some(StreamKind::Ts)),
            ("http://a/feed.mpegts?x=1", Some(StreamKind::Ts)),
            ("rtsp://cam.local/live", Some(StreamKind::Rtsp)),
            ("rtmps://cdn/app/key", Some(StreamKind::Rtmp)),
            ("udp://239.0.0.1:1234", Some(StreamKind::Udp)),
            ("mms://old.server/stream", Some(StreamKind::Mms)),
            ("srt://host:9000", Some(StreamKind::Srt)),
            ("https://a/video", None),
        ];
        for (url, expected) in cases {
            assert_eq!(FormatDetector::detect_by_path(url), expected, "url {url}");
        }
    }

    #[test]
    fn ts_suffix_does_not_shadow_hls() {
        // ".ts" inside an HLS path must not classify the playlist as raw TS
        assert_eq!(
            FormatDetector::detect_by_path("https://a/segments.ts/index.m3u8"),
            Some(StreamKind::Hls)
        );
    }

    #[test]
    fn sniffing_finds_playlist_markers() {
        assert_eq!(
            FormatDetector::sniff_text("#EXTM3U\n#EXT-X-VERSION:3\n"),
            Some(StreamKind::Hls)
        );
        assert_eq!(
            FormatDetector::sniff_text("<?xml version=\"1.0\"?><MPD xmlns=\"urn:mpeg:dash:schema\">"),
            Some(StreamKind::Dash)
        );
        assert_eq!(FormatDetector::sniff_text("GET / HTTP/1.1"), None);
    }

    #[test]
    fn master_vs_media_detection() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nhi/index.m3u8\n";
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg0001.ts\n";
        assert!(is_master_playlist(master));
        assert!(!is_master_playlist(media));
    }

    #[test]
    fn master_rewrite_prefixes_relative_variants() {
        let master = "#EXTM3U\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720\n\
                      hi/index.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=600000\n\
                      low/index.m3u8\n";
        let rewritten = rewrite_master_playlist(master, "192.168.1.50", 8080, "ch42");
        assert!(rewritten.contains("http://192.168.1.50:8080/stream/ch42/hi/index.m3u8"));
        assert!(rewritten.contains("http://192.168.1.50:8080/stream/ch42/low/index.m3u8"));
        // tag lines untouched
        assert!(rewritten.contains("#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720"));
    }

    #[test]
    fn rewrite_is_idempotent_on_absolute_urls() {
        let master = "#EXTM3U\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=2000000\n\
                      hi/index.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=600000\n\
                      https://cdn.example/absolute/low.m3u8\n";
        let once = rewrite_master_playlist(master, "10.0.0.2", 8080, "ch1");
        let twice = rewrite_master_playlist(&once, "10.0.0.2", 8080, "ch1");
        assert_eq!(once, twice);
        assert!(once.contains("https://cdn.example/absolute/low.m3u8"));
    }

    #[test]
    fn rewrite_covers_uri_attributes_and_root_relative_paths() {
        let master = "#EXTM3U\n\
                      #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",URI=\"audio/en.m3u8\"\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=2000000,AUDIO=\"aud\"\n\
                      /live/hi/index.m3u8\n";
        let rewritten = rewrite_master_playlist(master, "10.0.0.2", 8080, "ch9");
        assert!(rewritten.contains("URI=\"http://10.0.0.2:8080/stream/ch9/audio/en.m3u8\""));
        assert!(rewritten.contains("\nhttp://10.0.0.2:8080/stream/ch9/live/hi/index.m3u8"));
    }

    #[test]
    fn media_playlists_are_not_masters() {
        // segments with query strings still classify as media
        let media = "#EXTM3U\n#EXTINF:4.0,\nseg1.ts?auth=abc\n#EXTINF:4.0,\nseg2.ts?auth=abc\n";
        assert!(!is_master_playlist(media));
    }
}
