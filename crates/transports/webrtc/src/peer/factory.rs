//! Creates one WebRTC peer connection per negotiation

use super::PeerConnection;
use crate::config::WebRtcConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use posecast_core::{PeerRole, PeerTransport, TransportFactory};
use std::sync::Arc;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// [`TransportFactory`] backed by webrtc-rs
///
/// The media engine and interceptors are built once and shared by every
/// connection.
pub struct WebRtcTransportFactory {
    api: API,
    config: Arc<WebRtcConfig>,
}

impl std::fmt::Debug for WebRtcTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransportFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self> {
        config.validate()?;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            Error::WebRtcError(format!("Failed to register codecs: {}", e))
        })?;

        let interceptor_registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        info!(
            "WebRTC transport ready ({} STUN, {} TURN servers)",
            config.stun_servers.len(),
            config.turn_servers.len()
        );

        Ok(Self {
            api,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Create a connection with its concrete type
    pub async fn connect(&self, peer_id: &str, role: PeerRole) -> Result<Arc<PeerConnection>> {
        PeerConnection::new(
            &self.api,
            self.rtc_configuration(),
            peer_id,
            role,
            Arc::clone(&self.config),
        )
        .await
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
    ) -> posecast_core::Result<Arc<dyn PeerTransport>> {
        let connection = self.connect(peer_id, role).await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;
    use posecast_core::{SdpType, SessionDescription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use webrtc::peer_connection::RTCPeerConnection;

    fn offline_config() -> WebRtcConfig {
        WebRtcConfig {
            stun_servers: Vec::new(),
            ice_gathering_timeout_ms: 500,
            ..Default::default()
        }
    }

    /// A browser stand-in producing a real offer
    async fn offerer(
        factory: &WebRtcTransportFactory,
        video: bool,
    ) -> (Arc<RTCPeerConnection>, SessionDescription) {
        let pc = Arc::new(
            factory
                .api
                .new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        if video {
            pc.add_transceiver_from_kind(
                webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video,
                None,
            )
            .await
            .unwrap();
        }
        pc.create_data_channel("pose", None).await.unwrap();

        let offer = pc.create_offer(None).await.unwrap();
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), gathered.recv()).await;

        let sdp = pc.local_description().await.unwrap().sdp;
        (pc, SessionDescription::offer(sdp))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WebRtcConfig {
            turn_servers: vec![TurnServerConfig {
                url: "http://turn.example.com".to_string(),
                username: String::new(),
                credential: String::new(),
            }],
            ..Default::default()
        };
        assert!(WebRtcTransportFactory::new(config).unwrap_err().is_config_error());
    }

    #[test]
    fn test_ice_servers_from_config() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig {
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..Default::default()
        })
        .unwrap();

        let rtc = factory.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(rtc.ice_servers[1].username, "user");
    }

    #[tokio::test]
    async fn test_camera_answers_real_offer() {
        let factory = WebRtcTransportFactory::new(offline_config()).unwrap();
        let (remote, offer) = offerer(&factory, true).await;

        let transport = factory.create("camera-1", PeerRole::Camera).await.unwrap();
        let answer = transport.create_answer(offer).await.unwrap();

        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answer.sdp.starts_with("v=0"));
        assert!(answer.sdp.contains("m=video"));

        transport.close().await.unwrap();
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_offer_is_negotiation_error() {
        let factory = WebRtcTransportFactory::new(offline_config()).unwrap();
        let transport = factory.create("camera-1", PeerRole::Camera).await.unwrap();

        let err = transport
            .create_answer(SessionDescription::offer("not an sdp"))
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_relay_registered_then_attached_in_answer() {
        let factory = WebRtcTransportFactory::new(offline_config()).unwrap();
        let (remote, offer) = offerer(&factory, true).await;

        let monitor = factory.connect("monitor-1", PeerRole::Monitor).await.unwrap();
        let relay = posecast_core::RelayStream::new("cam-a-video");
        monitor.add_outbound_stream(relay.clone()).unwrap();
        // Registration alone touches neither the stream nor the connection
        assert_eq!(relay.subscriber_count(), 0);

        let answer = monitor.create_answer(offer).await.unwrap();
        assert!(answer.sdp.contains("m=video"));
        assert!(answer.sdp.contains("posecast-monitor-1"));
        assert_eq!(relay.subscriber_count(), 1);

        let late = posecast_core::RelayStream::new("cam-b-video");
        assert!(monitor.add_outbound_stream(late).is_err());

        monitor.close().await.unwrap();
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_rejects_outbound_stream() {
        let factory = WebRtcTransportFactory::new(offline_config()).unwrap();
        let camera = factory.create("camera-1", PeerRole::Camera).await.unwrap();

        let relay = posecast_core::RelayStream::new("cam-a-video");
        assert!(camera.add_outbound_stream(relay).is_err());

        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let factory = WebRtcTransportFactory::new(offline_config()).unwrap();
        let connection = factory.connect("camera-1", PeerRole::Camera).await.unwrap();

        let closed_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed_calls);
        connection.on_closed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert!(connection.is_closed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closed_calls.load(Ordering::SeqCst), 0);
    }
}
