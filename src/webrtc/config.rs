//! WebRTC configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// WebRTC configuration
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// UDP port shared by every peer connection
    pub udp_port: u16,
    /// ICE-TCP port
    pub tcp_port: u16,
    /// Address announced instead of the interface addresses
    pub nat_public_ip: Option<String>,
    /// Longest wait for ICE gathering before answering
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates (with NAT 1:1 mapping) are enough for a server
            stun_servers: vec![],
            turn_servers: vec![],
            udp_port: 8443,
            tcp_port: 8443,
            nat_public_ip: None,
            gather_timeout: Duration::from_secs(10),
        }
    }
}

impl WebRtcConfig {
    /// ICE servers handed to every peer connection
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];
        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &self.turn_servers {
            // webrtc-rs refuses TURN servers without credentials
            if turn.username.is_empty() || turn.credential.is_empty() {
                tracing::warn!(
                    "Skipping TURN server {:?} - credentials required but missing",
                    turn.urls
                );
                continue;
            }
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}
