//! Progressive (keep-alive) handler
//!
//! Some origins take 10-15 s to open a stream; media clients give up at
//! around 20. For streams flagged `connection_limited` the response goes
//! out immediately with MPEG-TS null packets every ~2 s while the real
//! URL resolves in a separate task. Once resolution lands the filler
//! stops, the encoder starts, and its stdout takes over the same
//! response. Client disconnect cancels both halves.

use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::errors::StreamError;
use crate::models::{EndReason, Stream, StreamPhase};
use crate::streaming::proxy::{BitrateSampler, SessionEndGuard, StreamProxy};
use crate::streaming::session_manager::{SessionUpdate, StartedSession};

/// Cadence of filler packets while the upstream resolves.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);
/// Delay between resolution attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// One MPEG-TS null packet: sync byte 0x47, PID 0x1FFF, no payload of
/// interest. Decoders discard these but the connection stays warm.
pub fn null_packet() -> Bytes {
    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x1F;
    packet[2] = 0xFF;
    packet[3] = 0x10;
    Bytes::copy_from_slice(&packet)
}

/// Serve a connection-limited stream: immediate 200 + filler, hand-off to
/// the encoder once the origin opens.
pub async fn serve(proxy: StreamProxy, stream: Stream, started: StartedSession) -> Response {
    let session_id = started.descriptor.session_id.clone();
    let sessions = proxy.sessions.clone();
    let settings = proxy.settings.load().await;
    let attempts = settings.streaming.reconnect_attempts.max(1);
    let buffer_size = settings.streaming.buffer_size;

    sessions
        .set_phase(&session_id, StreamPhase::Initializing)
        .await;

    let cancel = started.cancel.clone();
    let body_stream = async_stream::stream! {
        let mut guard = SessionEndGuard::new(sessions.clone(), session_id.clone(), None);
        sessions.set_phase(&session_id, StreamPhase::Resolving).await;

        let mut resolver = {
            let proxy = proxy.clone();
            let stream = stream.clone();
            tokio::spawn(async move { resolve_with_retries(&proxy, &stream, attempts).await })
        };

        // phase 1: filler until the resolver finishes
        let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        let resolved_url = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    resolver.abort();
                    return;
                }
                outcome = &mut resolver => {
                    match outcome {
                        Ok(Ok(url)) => break url,
                        Ok(Err(e)) => {
                            warn!("Upstream resolution failed for {}: {e}", stream.url);
                            sessions.set_phase(&session_id, StreamPhase::Error).await;
                            guard.reason = EndReason::FfmpegError;
                            return;
                        }
                        Err(e) => {
                            warn!("Resolver task failed: {e}");
                            sessions.set_phase(&session_id, StreamPhase::Error).await;
                            guard.reason = EndReason::FfmpegError;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let packet = null_packet();
                    sessions
                        .update(
                            &session_id,
                            SessionUpdate {
                                bytes_delta: packet.len() as u64,
                                current_bitrate: None,
                                error_delta: 0,
                            },
                        )
                        .await;
                    yield Ok::<_, std::io::Error>(packet);
                }
            }
        };

        sessions
            .set_phase(&session_id, StreamPhase::StreamResolved)
            .await;
        debug!("Resolved {} -> {resolved_url}", stream.url);

        // phase 2: hand off to the encoder
        sessions
            .set_phase(&session_id, StreamPhase::StartingFfmpeg)
            .await;
        let mut process = match proxy.encoder.spawn(&stream, &resolved_url).await {
            Ok(process) => process,
            Err(e) => {
                warn!("Encoder spawn failed after resolution: {e}");
                sessions.set_phase(&session_id, StreamPhase::Error).await;
                guard.reason = EndReason::FfmpegError;
                return;
            }
        };
        proxy.spawn_stderr_watcher(&mut process, &session_id);
        let Some(mut stdout) = process.take_stdout() else {
            sessions.set_phase(&session_id, StreamPhase::Error).await;
            guard.reason = EndReason::FfmpegError;
            return;
        };
        guard.attach_process(process);
        sessions.set_phase(&session_id, StreamPhase::Streaming).await;

        let mut sampler = BitrateSampler::new();
        let mut buf = vec![0u8; buffer_size.max(4096)];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::io::AsyncReadExt::read(&mut stdout, &mut buf) => match read {
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
                        yield Ok(Bytes::copy_from_slice(&buf[..n]));
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

    super::proxy::mpegts_response(Body::from_stream(body_stream))
}

/// Resolve the final stream URL, rotating through the primary and its
/// backups until the attempt budget runs out.
async fn resolve_with_retries(
    proxy: &StreamProxy,
    stream: &Stream,
    attempts: u32,
) -> Result<String, StreamError> {
    let mut candidates = vec![stream.url.as_str()];
    candidates.extend(stream.backup_urls.iter().map(String::as_str));

    let mut last_error = None;
    for attempt in 1..=attempts {
        let candidate = candidates[(attempt as usize - 1) % candidates.len()];
        match proxy.detector.resolve_final(candidate).await {
            Ok(url) => return Ok(url),
            Err(e) => {
                debug!("Resolution attempt {attempt}/{attempts} failed for {candidate}: {e}");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or(StreamError::ResolutionFailed {
        message: "no attempts made".to_string(),
    }))
}
