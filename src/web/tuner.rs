//! HDHomeRun emulation endpoints
//!
//! Plex probes `/discover.json` and `/device.xml`, fetches the lineup,
//! then requests `/stream/{channelId}` per tuned channel. Shapes here
//! stay bit-compatible with what Plex expects from a real HDHomeRun.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::cache::CacheService;
use crate::errors::AppError;
use crate::models::Channel;

use super::{client_info, AppState};

pub async fn discover(State(state): State<AppState>) -> Response {
    let settings = state.settings.load().await;
    let base = settings.device_base_url();
    Json(serde_json::json!({
        "FriendlyName": settings.device.name,
        "Manufacturer": "Silicondust",
        "ModelNumber": "HDTC-2US",
        "FirmwareName": "hdhomeruntc_atsc",
        "FirmwareVersion": settings.device.firmware,
        "DeviceID": settings.device.id,
        "DeviceAuth": "tuner_bridge",
        "BaseURL": base,
        "LineupURL": format!("{base}/lineup.json"),
        "TunerCount": settings.device.tuner_count,
    }))
    .into_response()
}

pub async fn device_xml(State(state): State<AppState>) -> Response {
    let settings = state.settings.load().await;
    let xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion>
    <major>1</major>
    <minor>0</minor>
  </specVersion>
  <URLBase>{base}</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>{name}</friendlyName>
    <manufacturer>Silicondust</manufacturer>
    <modelName>HDTC-2US</modelName>
    <modelNumber>HDTC-2US</modelNumber>
    <serialNumber>{id}</serialNumber>
    <UDN>uuid:2025-tuner-bridge-{id}</UDN>
  </device>
</root>
"#,
        base = settings.device_base_url(),
        name = xml_escape(&settings.device.name),
        id = settings.device.id,
    );
    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

pub async fn lineup(State(state): State<AppState>) -> Result<Response, AppError> {
    let key = CacheService::lineup_key();
    if let Some(cached) = state.cache.get_json::<serde_json::Value>(&key).await {
        return Ok(Json(cached).into_response());
    }

    let settings = state.settings.load().await;
    let base = settings.device_base_url();
    let channels = state.channels.lineup().await?;
    let lineup: Vec<serde_json::Value> = channels
        .iter()
        .map(|channel| {
            serde_json::json!({
                "GuideNumber": channel.number.to_string(),
                "GuideName": channel.name,
                "URL": format!("{base}/stream/{}", channel.id),
            })
        })
        .collect();
    let body = serde_json::Value::Array(lineup);
    state
        .cache
        .set_json(&key, &body, Some(crate::cache::API_TTL))
        .await;
    Ok(Json(body).into_response())
}

pub async fn lineup_status() -> Response {
    Json(serde_json::json!({
        "ScanInProgress": 0,
        "ScanPossible": 1,
        "Source": "Cable",
        "SourceList": ["Cable"],
    }))
    .into_response()
}

/// Resolve a channel by id, falling back to the channel number for
/// clients that tune "channel 100" directly.
async fn find_channel(state: &AppState, channel_ref: &str) -> Result<Option<Channel>, AppError> {
    if let Some(channel) = state.channels.get(channel_ref).await? {
        return Ok(Some(channel));
    }
    if let Ok(number) = channel_ref.parse::<i64>() {
        return state.channels.find_by_number(number).await;
    }
    Ok(None)
}

pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_ref): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let channel = match find_channel(&state, &channel_ref).await {
        Ok(Some(channel)) if channel.enabled => channel,
        Ok(_) => {
            return (StatusCode::NOT_FOUND, "channel not found").into_response();
        }
        Err(e) => return e.into_response(),
    };
    let stream = match state.streams.primary_for_channel(&channel.id).await {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "channel has no enabled stream").into_response();
        }
        Err(e) => return e.into_response(),
    };

    let client = client_info(addr, &headers);
    debug!(
        "Tune request: channel {} ({}) from {}",
        channel.name, channel.number, client.addr
    );
    state
        .proxy
        .handle_channel_request(channel, stream, client)
        .await
}

pub async fn stream_segment(
    State(state): State<AppState>,
    Path((channel_ref, segment)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let channel = match find_channel(&state, &channel_ref).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return (StatusCode::NOT_FOUND, "channel not found").into_response(),
        Err(e) => return e.into_response(),
    };
    let stream = match state.streams.primary_for_channel(&channel.id).await {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "channel has no enabled stream").into_response();
        }
        Err(e) => return e.into_response(),
    };

    let client = client_info(addr, &headers);
    state
        .proxy
        .handle_segment_request(stream, client, &segment)
        .await
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escaping() {
        assert_eq!(xml_escape("Den <TV> & \"Attic\""), "Den &lt;TV&gt; &amp; &quot;Attic&quot;");
        assert_eq!(xml_escape("plain"), "plain");
    }
}
