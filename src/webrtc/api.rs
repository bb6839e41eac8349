//! Shared WebRTC API: codecs, interceptors and the single-port ICE transport

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use super::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::utils::{bind_udp_socket, local_ip_addresses};

const MIME_TYPE_RTX: &str = "video/rtx";

/// H.264 variants accepted from publishers: (payload type, fmtp line)
const H264_VARIANTS: [(u8, &str); 5] = [
    (102, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
    (127, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f"),
    (125, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
    (108, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f"),
    (123, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032"),
];

const VIDEO_HEADER_EXTENSIONS: [&str; 3] = [
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
];

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

fn video_codec(mime_type: &str, payload_type: u8, fmtp: &str, feedback: Vec<RTCPFeedback>) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: feedback,
        },
        payload_type,
        ..Default::default()
    }
}

/// Media engine with the codecs the ingest pipeline can containerize
pub fn ingest_media_engine() -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| AppError::PeerConnection(format!("Failed to register Opus codec: {}", e)))?;

    let mut video_codecs = vec![video_codec(MIME_TYPE_VP8, 96, "", video_rtcp_feedback())];
    for (payload_type, fmtp) in H264_VARIANTS {
        video_codecs.push(video_codec(MIME_TYPE_H264, payload_type, fmtp, video_rtcp_feedback()));
    }
    video_codecs.push(video_codec(MIME_TYPE_RTX, 109, "apt=108", vec![]));

    for codec in video_codecs {
        let payload_type = codec.payload_type;
        media_engine
            .register_codec(codec, RTPCodecType::Video)
            .map_err(|e| {
                AppError::PeerConnection(format!(
                    "Failed to register video codec (pt {}): {}",
                    payload_type, e
                ))
            })?;
    }

    for uri in VIDEO_HEADER_EXTENSIONS {
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                },
                RTPCodecType::Video,
                None,
            )
            .map_err(|e| {
                AppError::PeerConnection(format!("Failed to register header extension {}: {}", uri, e))
            })?;
    }

    Ok(media_engine)
}

/// Addresses announced in host candidates
fn nat_ips(config: &WebRtcConfig) -> Vec<String> {
    if let Some(ip) = &config.nat_public_ip {
        return vec![ip.clone()];
    }
    match local_ip_addresses() {
        Ok(ips) => ips
            .into_iter()
            .filter(IpAddr::is_ipv4)
            .map(|ip| ip.to_string())
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to list local addresses: {}", e);
            vec![]
        }
    }
}

/// Builds every peer connection of the process on top of one UDP socket
pub struct IngestApi {
    api: API,
    config: WebRtcConfig,
    udp_addr: SocketAddr,
}

impl IngestApi {
    /// Bind the ICE UDP port and build the API. Must run inside a tokio runtime.
    pub fn new(config: WebRtcConfig) -> Result<Self> {
        let mut media_engine = ingest_media_engine()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| AppError::PeerConnection(format!("Failed to register interceptors: {}", e)))?;

        let socket = bind_udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.udp_port)))
            .and_then(tokio::net::UdpSocket::from_std)
            .map_err(|e| {
                AppError::PeerConnection(format!(
                    "Failed to bind ICE UDP port {}: {}",
                    config.udp_port, e
                ))
            })?;
        let udp_addr = socket.local_addr()?;
        tracing::info!("Listening UDP for WebRTC traffic on {}", udp_addr);
        tracing::info!(
            "ICE-TCP port {} configured; webrtc-rs gathers UDP candidates only",
            config.tcp_port
        );

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
            socket,
        ))));
        setting_engine.set_network_types(vec![NetworkType::Udp4]);

        let ips = nat_ips(&config);
        if !ips.is_empty() {
            tracing::info!("Announcing host candidates for {:?}", ips);
            setting_engine.set_nat_1to1_ips(ips, RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config,
            udp_addr,
        })
    }

    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };
        let pc = self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::PeerConnection(format!("Failed to create peer connection: {}", e))
        })?;
        Ok(Arc::new(pc))
    }

    pub fn gather_timeout(&self) -> Duration {
        self.config.gather_timeout
    }

    /// Local address of the shared ICE socket
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_engine_registers_ingest_codecs() {
        assert!(ingest_media_engine().is_ok());
    }

    #[test]
    fn test_nat_ips_prefer_public_ip() {
        let config = WebRtcConfig {
            nat_public_ip: Some("203.0.113.9".to_string()),
            ..Default::default()
        };
        assert_eq!(nat_ips(&config), vec!["203.0.113.9".to_string()]);
    }

    #[tokio::test]
    async fn test_api_binds_ephemeral_udp_port() {
        let config = WebRtcConfig {
            udp_port: 0,
            ..Default::default()
        };
        let api = IngestApi::new(config).unwrap();
        assert_ne!(api.udp_addr().port(), 0);

        let pc = api.new_peer_connection().await.unwrap();
        pc.close().await.unwrap();
    }
}
