//! Per-request stream proxy
//!
//! One instance serves the whole tuner surface; each request borrows a
//! session from the session manager for its lifetime. Handler choice:
//! connection-limited streams get the progressive keep-alive path, HLS
//! and DASH can be proxied directly, everything else goes through the
//! encoder to MPEG-TS.
//!
//! The byte pump owns the encoder child through a guard: whether the
//! client disconnects, the child exits, or the manager cancels the
//! session, the guard ends the session with the right reason and runs
//! the kill protocol.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cache::CacheService;
use crate::errors::AppError;
use crate::models::{Channel, EndReason, Stream, StreamKind};
use crate::settings::SettingsService;
use crate::streaming::detector::{is_master_playlist, rewrite_master_playlist, FormatDetector};
use crate::streaming::ffmpeg::{classify_stderr_line, FfmpegCommandBuilder, FfmpegProcess, StderrSeverity};
use crate::streaming::session_manager::{SessionManager, SessionRequest, SessionUpdate, StartedSession};
use crate::utils::url::UrlUtils;

/// Bitrate samples are only taken once at least this much time passed.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Who is asking, as seen by the HTTP layer.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub addr: String,
    pub user_agent: Option<String>,
    pub forwarded_for: Option<String>,
}

impl ClientInfo {
    /// Stable fingerprint: base64 of `(forwardedFor||address)|userAgent`,
    /// truncated to 16 characters.
    pub fn fingerprint(&self) -> String {
        let identity = self.forwarded_for.as_deref().unwrap_or(&self.addr);
        let material = format!("{}|{}", identity, self.user_agent.as_deref().unwrap_or(""));
        let mut encoded = base64::engine::general_purpose::STANDARD.encode(material);
        encoded.truncate(16);
        encoded
    }
}

#[derive(Clone)]
pub struct StreamProxy {
    pub sessions: Arc<SessionManager>,
    pub settings: Arc<SettingsService>,
    pub cache: CacheService,
    pub detector: Arc<FormatDetector>,
    pub encoder: Arc<FfmpegCommandBuilder>,
    pub http: reqwest::Client,
}

impl StreamProxy {
    /// Entry point behind `GET /stream/{channelId}`.
    pub async fn handle_channel_request(
        &self,
        channel: Channel,
        stream: Stream,
        client: ClientInfo,
    ) -> Response {
        let request = SessionRequest {
            stream_id: stream.id.clone(),
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            channel_number: channel.number,
            client_addr: client.addr.clone(),
            client_fingerprint: client.fingerprint(),
            user_agent: client.user_agent.clone(),
            stream_url: stream.url.clone(),
            kind: stream.kind,
        };

        let started = match self.sessions.start(request).await {
            Ok(started) => started,
            Err(e) => return AppError::Admission(e).into_response(),
        };

        if stream.connection_limited {
            return super::progressive::serve(self.clone(), stream, started).await;
        }

        // declared kinds are trusted; a generic http source gets classified
        // so an HLS origin behind a plain URL still takes the playlist path
        let kind = if stream.kind == StreamKind::Http {
            match self.detector.detect(&stream.url).await.kind {
                Some(detected) if detected != stream.kind => {
                    debug!("Reclassified {} as {detected}", stream.url);
                    detected
                }
                _ => stream.kind,
            }
        } else {
            stream.kind
        };

        match kind {
            StreamKind::Hls => self.serve_hls_direct(stream, started).await,
            StreamKind::Dash => self.serve_passthrough(stream, started).await,
            _ => self.serve_transcoded(stream, started).await,
        }
    }

    /// HLS direct proxy: master playlists are rewritten so sub-requests
    /// come back through us; media playlists pass through unchanged. The
    /// session stays alive and is fed by the follow-up segment requests;
    /// the inactivity timer reaps it when the client stops asking.
    async fn serve_hls_direct(&self, stream: Stream, started: StartedSession) -> Response {
        let session_id = started.descriptor.session_id.clone();
        let (text, final_url) = match self.fetch_playlist_text(&stream).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Playlist fetch failed for {}: {e}", stream.url);
                self.sessions.end(&session_id, EndReason::FfmpegError).await;
                return (StatusCode::BAD_GATEWAY, "upstream playlist unavailable").into_response();
            }
        };

        // remember where redirects landed: segment requests resolve
        // relative to the final URL
        self.cache
            .set(
                &CacheService::stream_key(&stream.id),
                &final_url,
                Some(crate::cache::STREAM_TTL),
            )
            .await;

        let settings = self.settings.load().await;
        let body = if is_master_playlist(&text) {
            rewrite_master_playlist(
                &text,
                &settings.network.advertised_host,
                settings.network.streaming_port,
                &started.descriptor.channel_id,
            )
        } else {
            text
        };

        self.sessions
            .update(
                &session_id,
                SessionUpdate {
                    bytes_delta: body.len() as u64,
                    current_bitrate: None,
                    error_delta: 0,
                },
            )
            .await;

        (
            [
                (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            ],
            body,
        )
            .into_response()
    }

    /// Segment fetch path used by rewritten master playlists: proxy the
    /// upstream bytes unchanged while accounting them to the client's
    /// session, if one is active.
    pub async fn handle_segment_request(
        &self,
        stream: Stream,
        client: ClientInfo,
        segment: &str,
    ) -> Response {
        let base = match self.segment_base(&stream).await {
            Ok(base) => base,
            Err(e) => {
                warn!("Segment base resolution failed for {}: {e}", stream.url);
                return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
            }
        };
        let target = match UrlUtils::join(&base, segment) {
            Ok(url) => url,
            Err(_) => return (StatusCode::BAD_REQUEST, "bad segment path").into_response(),
        };

        let mut request = self.http.get(&target);
        if let Some(auth) = &stream.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let upstream = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return (StatusCode::BAD_GATEWAY, format!("upstream {}", response.status()))
                    .into_response()
            }
            Err(e) => {
                return (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response()
            }
        };

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp2t")
            .to_string();

        let session = self
            .sessions
            .get_active_by_client_and_stream(&client.fingerprint(), &stream.id)
            .await;
        let sessions = self.sessions.clone();
        let session_id = session.map(|s| s.session_id);

        let body_stream = async_stream::stream! {
            let mut upstream = upstream;
            let mut sampler = BitrateSampler::new();
            loop {
                match upstream.chunk().await {
                    Ok(Some(chunk)) => {
                        if let Some(id) = &session_id {
                            sessions
                                .update(
                                    id,
                                    SessionUpdate {
                                        bytes_delta: chunk.len() as u64,
                                        current_bitrate: sampler.observe(chunk.len()),
                                        error_delta: 0,
                                    },
                                )
                                .await;
                        }
                        yield Ok::<_, std::io::Error>(chunk);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Segment proxy read error: {e}");
                        break;
                    }
                }
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// DASH (and other passthrough-able) sources: pipe upstream bytes
    /// unchanged while accounting them.
    async fn serve_passthrough(&self, stream: Stream, started: StartedSession) -> Response {
        let session_id = started.descriptor.session_id.clone();
        let mut request = self.http.get(&stream.url);
        if let Some(auth) = &stream.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        for (name, value) in &stream.headers {
            request = request.header(name, value);
        }
        let upstream = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                self.sessions.end(&session_id, EndReason::FfmpegError).await;
                return (StatusCode::BAD_GATEWAY, format!("upstream {}", response.status()))
                    .into_response();
            }
            Err(e) => {
                self.sessions.end(&session_id, EndReason::FfmpegError).await;
                return (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response();
            }
        };

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/dash+xml")
            .to_string();

        let sessions = self.sessions.clone();
        let cancel = started.cancel.clone();
        let body_stream = async_stream::stream! {
            let mut upstream = upstream;
            let mut guard = SessionEndGuard::new(sessions.clone(), session_id.clone(), None);
            let mut sampler = BitrateSampler::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = upstream.chunk() => match chunk {
                        Ok(Some(chunk)) => {
                            sessions
                                .update(
                                    &session_id,
                                    SessionUpdate {
                                        bytes_delta: chunk.len() as u64,
                                        current_bitrate: sampler.observe(chunk.len()),
                                        error_delta: 0,
                                    },
                                )
                                .await;
                            yield Ok::<_, std::io::Error>(chunk);
                        }
                        Ok(None) => {
                            guard.reason = EndReason::Normal;
                            break;
                        }
                        Err(e) => {
                            debug!("Passthrough read error: {e}");
                            guard.reason = EndReason::ProcessClosed;
                            break;
                        }
                    },
                }
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT_RANGES, "none")
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// Everything else: drive the encoder and stream its stdout.
    async fn serve_transcoded(&self, stream: Stream, started: StartedSession) -> Response {
        let session_id = started.descriptor.session_id.clone();

        // http(s) inputs go through redirect resolution so the encoder
        // does not burn its reconnect budget on 302s
        let input_url = if matches!(stream.kind, StreamKind::Http | StreamKind::Ts) {
            match self.detector.resolve_final(&stream.url).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!("Redirect resolution failed for {}: {e}, using original", stream.url);
                    stream.url.clone()
                }
            }
        } else {
            stream.url.clone()
        };

        let process = match self.encoder.spawn(&stream, &input_url).await {
            Ok(process) => process,
            Err(e) => {
                warn!("Encoder spawn failed for {}: {e}", stream.id);
                self.sessions.end(&session_id, EndReason::FfmpegError).await;
                return (StatusCode::BAD_GATEWAY, "encoder unavailable").into_response();
            }
        };

        let settings = self.settings.load().await;
        self.stream_process_response(process, started, settings.streaming.buffer_size)
            .await
    }

    /// Shared tail of the transcode and progressive paths: pump encoder
    /// stdout into the response, watch stderr, clean up on every exit.
    pub(crate) async fn stream_process_response(
        &self,
        mut process: FfmpegProcess,
        started: StartedSession,
        buffer_size: usize,
    ) -> Response {
        let session_id = started.descriptor.session_id.clone();
        self.spawn_stderr_watcher(&mut process, &session_id);

        let Some(stdout) = process.take_stdout() else {
            self.sessions.end(&session_id, EndReason::FfmpegError).await;
            return (StatusCode::BAD_GATEWAY, "encoder pipe unavailable").into_response();
        };

        let sessions = self.sessions.clone();
        let cancel = started.cancel.clone();
        let body_stream = async_stream::stream! {
            let mut stdout = stdout;
            let mut guard = SessionEndGuard::new(sessions.clone(), session_id.clone(), Some(process));
            let mut sampler = BitrateSampler::new();
            let mut buf = vec![0u8; buffer_size.max(4096)];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // manager already ended the session; just stop
                        break;
                    }
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => {
                            guard.reason = EndReason::ProcessClosed;
                            break;
                        }
                        Ok(n) => {
                            sessions
                                .update(
                                    &session_id,
                                    SessionUpdate {
                                        bytes_delta: n as u64,
                                        current_bitrate: sampler.observe(n),
                                        error_delta: 0,
                                    },
                                )
                                .await;
                            yield Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(&buf[..n]));
                        }
                        Err(e) => {
                            debug!("Encoder stdout read error: {e}");
                            guard.reason = EndReason::FfmpegError;
                            break;
                        }
                    },
                }
            }
        };

        mpegts_response(Body::from_stream(body_stream))
    }

    pub(crate) fn spawn_stderr_watcher(&self, process: &mut FfmpegProcess, session_id: &str) {
        let Some(stderr) = process.take_stderr() else {
            return;
        };
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match classify_stderr_line(&line) {
                    StderrSeverity::Critical => {
                        warn!("Encoder [{session_id}]: {line}");
                        sessions
                            .update(
                                &session_id,
                                SessionUpdate {
                                    bytes_delta: 0,
                                    current_bitrate: None,
                                    error_delta: 1,
                                },
                            )
                            .await;
                    }
                    StderrSeverity::Warning => debug!("Encoder [{session_id}]: {line}"),
                    StderrSeverity::Info => {}
                }
            }
        });
    }

    async fn fetch_playlist_text(&self, stream: &Stream) -> Result<(String, String), AppError> {
        let mut request = self.http.get(&stream.url);
        if let Some(auth) = &stream.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        for (name, value) in &stream.headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AppError::Stream(crate::errors::StreamError::UpstreamStatus {
                status: response.status().as_u16(),
            }));
        }
        let final_url = response.url().to_string();
        let text = response.text().await?;
        Ok((text, final_url))
    }

    /// Base URL that segment paths are relative to: the redirect-resolved
    /// playlist URL, cached per stream.
    async fn segment_base(&self, stream: &Stream) -> Result<String, AppError> {
        let key = CacheService::stream_key(&stream.id);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let resolved = self.detector.resolve_final(&stream.url).await?;
        self.cache
            .set(&key, &resolved, Some(crate::cache::STREAM_TTL))
            .await;
        Ok(resolved)
    }
}

/// MPEG-TS streaming response headers per the tuner contract.
pub(crate) fn mpegts_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::ACCEPT_RANGES, "none")
        .header(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        )
        .header(header::CONNECTION, "close")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Ends the session and shuts the encoder down when the byte pump stops
/// for any reason, including the client going away mid-yield.
pub(crate) struct SessionEndGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
    process: Option<FfmpegProcess>,
    pub reason: EndReason,
}

impl SessionEndGuard {
    pub fn new(
        sessions: Arc<SessionManager>,
        session_id: String,
        process: Option<FfmpegProcess>,
    ) -> Self {
        Self {
            sessions,
            session_id,
            process,
            // a dropped generator without an explicit reason means the
            // client went away
            reason: EndReason::ClientDisconnect,
        }
    }

    /// The progressive handler gains its encoder only after resolution.
    pub fn attach_process(&mut self, process: FfmpegProcess) {
        self.process = Some(process);
    }
}

impl Drop for SessionEndGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let process = self.process.take();
        let reason = self.reason;
        tokio::spawn(async move {
            sessions.end(&session_id, reason).await;
            if let Some(process) = process {
                process.shutdown().await;
            }
        });
    }
}

/// Computes `8 * bytes / Δt` bitrates, gated to sample intervals of at
/// least [`MIN_SAMPLE_INTERVAL`] for numerical stability.
pub(crate) struct BitrateSampler {
    window_start: tokio::time::Instant,
    window_bytes: u64,
}

impl BitrateSampler {
    pub fn new() -> Self {
        Self {
            window_start: tokio::time::Instant::now(),
            window_bytes: 0,
        }
    }

    /// Record a chunk; returns a bitrate (bits/sec) when the gate passes.
    pub fn observe(&mut self, chunk_bytes: usize) -> Option<u64> {
        self.window_bytes += chunk_bytes as u64;
        let elapsed = self.window_start.elapsed();
        if elapsed < MIN_SAMPLE_INTERVAL {
            return None;
        }
        let bits = self.window_bytes * 8;
        let bitrate = (bits as f64 / elapsed.as_secs_f64()) as u64;
        self.window_start = tokio::time::Instant::now();
        self.window_bytes = 0;
        Some(bitrate)
    }
}
