//! LAN discovery (SSDP)
//!
//! Joins the discovery multicast group, answers unicast M-SEARCH queries
//! and emits periodic NOTIFY announcements so Plex can find the tuner
//! without configuration. The advertised location is rebuilt whenever
//! device or network settings change.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::settings::{Settings, SettingsChange};

const SERVER_HEADER: &str = concat!(
    "Linux/3.14 UPnP/1.0 TunerBridge/",
    env!("CARGO_PKG_VERSION")
);

/// Search targets we claim to be.
const SEARCH_TARGETS: &[&str] = &[
    "ssdp:all",
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:MediaServer:1",
];

/// What the announcements advertise. Rebuilt from settings on change.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub location: String,
    pub device_uuid: String,
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
}

impl Advertisement {
    pub fn from_settings(settings: &Settings) -> Self {
        let multicast_address = settings
            .ssdp
            .multicast_address
            .parse()
            .unwrap_or(Ipv4Addr::new(239, 255, 255, 250));
        Self {
            location: format!("{}/device.xml", settings.device_base_url()),
            device_uuid: format!("2025-tuner-bridge-{}", settings.device.id),
            multicast_address,
            port: settings.network.discovery_port,
            announce_interval: Duration::from_secs(settings.ssdp.announce_interval.max(30)),
        }
    }

    fn notify_message(&self) -> String {
        format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: {}:{}\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             LOCATION: {}\r\n\
             NT: upnp:rootdevice\r\n\
             NTS: ssdp:alive\r\n\
             SERVER: {}\r\n\
             USN: uuid:{}::upnp:rootdevice\r\n\r\n",
            self.multicast_address, self.port, self.location, SERVER_HEADER, self.device_uuid
        )
    }

    fn search_response(&self, search_target: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             EXT:\r\n\
             LOCATION: {}\r\n\
             SERVER: {}\r\n\
             ST: {}\r\n\
             USN: uuid:{}::upnp:rootdevice\r\n\r\n",
            self.location, SERVER_HEADER, search_target, self.device_uuid
        )
    }
}

pub struct SsdpService {
    advertisement: Arc<RwLock<Advertisement>>,
    announce_now: Arc<Notify>,
    cancel: RwLock<Option<CancellationToken>>,
}

impl SsdpService {
    pub fn new(settings: &Settings) -> Self {
        Self {
            advertisement: Arc::new(RwLock::new(Advertisement::from_settings(settings))),
            announce_now: Arc::new(Notify::new()),
            cancel: RwLock::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.cancel.read().await.is_some()
    }

    /// Bind the discovery socket, join the group, and spawn the announce
    /// and responder loops.
    pub async fn start(&self) -> std::io::Result<()> {
        let advertisement = self.advertisement.read().await.clone();
        let socket = UdpSocket::bind(("0.0.0.0", advertisement.port)).await?;
        socket.join_multicast_v4(advertisement.multicast_address, Ipv4Addr::UNSPECIFIED)?;
        let socket = Arc::new(socket);
        info!(
            "SSDP listening on {}:{} advertising {}",
            advertisement.multicast_address, advertisement.port, advertisement.location
        );

        let cancel = CancellationToken::new();
        *self.cancel.write().await = Some(cancel.clone());

        // announcer
        {
            let socket = socket.clone();
            let state = self.advertisement.clone();
            let announce_now = self.announce_now.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let advertisement = state.read().await.clone();
                    let target: SocketAddr =
                        (advertisement.multicast_address, advertisement.port).into();
                    let message = advertisement.notify_message();
                    if let Err(e) = socket.send_to(message.as_bytes(), target).await {
                        warn!("SSDP announce failed: {e}");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = announce_now.notified() => {}
                        _ = tokio::time::sleep(advertisement.announce_interval) => {}
                    }
                }
            });
        }

        // M-SEARCH responder
        {
            let socket = socket.clone();
            let state = self.advertisement.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = socket.recv_from(&mut buf) => {
                            let (len, peer) = match received {
                                Ok(ok) => ok,
                                Err(e) => {
                                    warn!("SSDP receive failed: {e}");
                                    continue;
                                }
                            };
                            let request = String::from_utf8_lossy(&buf[..len]);
                            if let Some(st) = matched_search_target(&request) {
                                let advertisement = state.read().await.clone();
                                let response = advertisement.search_response(st);
                                debug!("Answering M-SEARCH ({st}) from {peer}");
                                if let Err(e) = socket.send_to(response.as_bytes(), peer).await {
                                    warn!("SSDP unicast response failed: {e}");
                                }
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.write().await.take() {
            cancel.cancel();
            info!("SSDP stopped");
        }
    }

    /// Point announcements at a new host without a restart.
    pub async fn update_advertised_host(&self, settings: &Settings) {
        let next = Advertisement::from_settings(settings);
        let mut advertisement = self.advertisement.write().await;
        if *advertisement != next {
            *advertisement = next;
            drop(advertisement);
            self.announce_now.notify_one();
        }
    }

    /// Re-announce immediately (device name or id changed).
    pub fn refresh_device(&self) {
        self.announce_now.notify_one();
    }

    /// Apply settings changes that touch the advertised identity.
    pub fn watch_settings(
        self: &Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<SettingsChange>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            while let Ok(change) = rx.recv().await {
                let relevant = change.changed.iter().any(|path| {
                    path.starts_with("device.") || path.starts_with("network.") || path == "*"
                });
                if relevant {
                    service.update_advertised_host(&change.settings).await;
                    service.refresh_device();
                }
            }
        });
    }
}

fn matched_search_target(request: &str) -> Option<&'static str> {
    if !request.starts_with("M-SEARCH") {
        return None;
    }
    let st_line = request
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("st:"))?;
    let requested = st_line[3..].trim();
    SEARCH_TARGETS
        .iter()
        .find(|target| requested.eq_ignore_ascii_case(target))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msearch(st: &str) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: {st}\r\n\r\n"
        )
    }

    #[test]
    fn msearch_matching() {
        assert_eq!(
            matched_search_target(&msearch("upnp:rootdevice")),
            Some("upnp:rootdevice")
        );
        assert_eq!(matched_search_target(&msearch("ssdp:all")), Some("ssdp:all"));
        assert_eq!(
            matched_search_target(&msearch("urn:schemas-upnp-org:device:MediaServer:1")),
            Some("urn:schemas-upnp-org:device:MediaServer:1")
        );
        assert_eq!(matched_search_target(&msearch("roku:ecp")), None);
        assert_eq!(matched_search_target("NOTIFY * HTTP/1.1\r\n"), None);
    }

    #[test]
    fn advertisement_derives_from_settings() {
        let mut settings = Settings::default();
        settings.network.advertised_host = "192.168.1.50".to_string();
        settings.network.streaming_port = 8090;
        let advertisement = Advertisement::from_settings(&settings);
        assert_eq!(advertisement.location, "http://192.168.1.50:8090/device.xml");
        assert_eq!(advertisement.port, 1900);

        let notify = advertisement.notify_message();
        assert!(notify.starts_with("NOTIFY * HTTP/1.1\r\n"));
        assert!(notify.contains("LOCATION: http://192.168.1.50:8090/device.xml\r\n"));
        assert!(notify.contains("NTS: ssdp:alive\r\n"));

        let response = advertisement.search_response("ssdp:all");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("ST: ssdp:all\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
