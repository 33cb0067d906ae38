//! Tuner surface integration tests
//!
//! Drives the real router with in-process requests: discovery and lineup
//! shapes, and settings changes showing up in `/discover.json`.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;
use tuner_bridge::database::channels::NewChannel;
use tuner_bridge::web::router;

async fn get_json(app: &axum::Router, path: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn discover_json_reflects_device_settings() {
    let (state, _dir) = common::test_state().await;
    let app = router(state.clone());

    let (status, body) = get_json(&app, "/discover.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["TunerCount"], 4);
    assert_eq!(body["DeviceID"], "12345678");
    assert!(body["LineupURL"]
        .as_str()
        .unwrap()
        .ends_with("/lineup.json"));

    // a tunerCount update shows up on the next probe
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/settings")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"plexlive": {"device": {"tunerCount": 8}}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, body) = get_json(&app, "/discover.json").await;
    assert_eq!(body["TunerCount"], 8);
}

#[tokio::test]
async fn lineup_lists_enabled_channels_with_stream_urls() {
    let (state, _dir) = common::test_state().await;

    state
        .channels
        .create(NewChannel {
            name: "News One".to_string(),
            number: 100,
            enabled: true,
            logo_url: None,
            epg_id: None,
        })
        .await
        .unwrap();
    state
        .channels
        .create(NewChannel {
            name: "Hidden".to_string(),
            number: 200,
            enabled: false,
            logo_url: None,
            epg_id: None,
        })
        .await
        .unwrap();

    let app = router(state);
    let (status, body) = get_json(&app, "/lineup.json").await;
    assert_eq!(status, StatusCode::OK);

    let lineup = body.as_array().unwrap();
    assert_eq!(lineup.len(), 1);
    assert_eq!(lineup[0]["GuideNumber"], "100");
    assert_eq!(lineup[0]["GuideName"], "News One");
    assert!(lineup[0]["URL"].as_str().unwrap().contains("/stream/"));
}

#[tokio::test]
async fn lineup_status_is_plex_acceptable() {
    let (state, _dir) = common::test_state().await;
    let app = router(state);
    let (status, body) = get_json(&app, "/lineup_status.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ScanInProgress"], 0);
    assert_eq!(body["ScanPossible"], 1);
}

#[tokio::test]
async fn device_xml_carries_the_device_name() {
    let (state, _dir) = common::test_state().await;
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/device.xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE.as_str()],
        "application/xml"
    );
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let xml = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(xml.contains("<friendlyName>TunerBridge</friendlyName>"));
    assert!(xml.contains("<URLBase>http://127.0.0.1:8080</URLBase>"));
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (state, _dir) = common::test_state().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = get_json(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subsystems"]["database"], "healthy");
    // discovery is intentionally not started in tests
    assert_eq!(body["subsystems"]["ssdp"], "stopped");
}

#[tokio::test]
async fn unknown_channel_is_404() {
    let (state, _dir) = common::test_state().await;
    // stream handlers read the peer address; oneshot has none, so mock it
    let app = router(state).layer(axum::extract::connect_info::MockConnectInfo(
        std::net::SocketAddr::from(([127, 0, 0, 1], 40000)),
    ));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/stream/no-such-channel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
