//! Runtime configuration
//!
//! Every option is a command line flag that can also be set from the
//! environment, so the service can run unchanged in a container.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::processor::HlsSettings;
use crate::webrtc::config::{TurnServer, WebRtcConfig};

pub const DEFAULT_HTTP_PORT: u16 = 8089;
pub const DEFAULT_UDP_PORT: u16 = 8443;
pub const DEFAULT_TCP_PORT: u16 = 8443;

#[derive(Args, Debug, Clone)]
pub struct IngestConfig {
    /// HTTP listen host
    #[arg(long, env = "INGEST_HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: String,

    /// HTTP listen port
    #[arg(long = "http-port", env = "INGEST_HTTP_PORT", default_value = "8089")]
    pub http_port_raw: String,

    /// Single UDP port for all ICE traffic
    #[arg(long = "udp-port", env = "INGEST_UDP_PORT", default_value = "8443")]
    pub udp_port_raw: String,

    /// ICE-TCP port
    #[arg(long = "tcp-port", env = "INGEST_TCP_PORT", default_value = "8443")]
    pub tcp_port_raw: String,

    /// Public IP announced in host candidates (local interfaces when unset)
    #[arg(long, env = "INGEST_NAT_PUBLIC_IP")]
    pub nat_public_ip: Option<String>,

    /// Offer a TURN relay to peers
    #[arg(
        long,
        env = "TURN_ENABLE",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub turn_enable: bool,

    #[arg(long, env = "TURN_URL")]
    pub turn_url: Option<String>,

    #[arg(long, env = "TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "TURN_PASSWORD", hide_env_values = true)]
    pub turn_password: Option<String>,

    /// Broadcaster this ingest instance serves
    #[arg(long, env = "INGEST_BROADCASTER_ID")]
    pub broadcaster_id: Option<String>,

    #[arg(long, env = "INGEST_USERNAME")]
    pub username: Option<String>,

    /// Stop the process when the ingest session ends
    #[arg(
        long,
        env = "INGEST_FAIL_FAST",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub fail_fast: bool,

    /// Transcoder binary
    #[arg(long, env = "INGEST_FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// HLS segment duration in seconds
    #[arg(long, env = "INGEST_HLS_TIME", default_value_t = 4)]
    pub hls_time: u32,

    /// Segments kept in the HLS playlist
    #[arg(long, env = "INGEST_HLS_LIST_SIZE", default_value_t = 8)]
    pub hls_list_size: u32,

    /// Parent of the per-session HLS directories (system temp dir when unset)
    #[arg(long, env = "INGEST_HLS_DIR")]
    pub hls_dir: Option<PathBuf>,

    /// Upper bound on ICE gathering before an answer is sent
    #[arg(long, env = "INGEST_ICE_GATHER_TIMEOUT_SECS", default_value_t = 10)]
    pub ice_gather_timeout_secs: u64,
}

/// Parse a port, falling back to `default` on garbage
fn parse_port(raw: &str, default: u16, name: &str) -> u16 {
    match raw.trim().parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            tracing::error!("Wrong {} port {}. Fallback to {}", name, raw, default);
            default
        }
    }
}

impl IngestConfig {
    pub fn http_port(&self) -> u16 {
        parse_port(&self.http_port_raw, DEFAULT_HTTP_PORT, "http")
    }

    pub fn udp_port(&self) -> u16 {
        parse_port(&self.udp_port_raw, DEFAULT_UDP_PORT, "udp")
    }

    pub fn tcp_port(&self) -> u16 {
        parse_port(&self.tcp_port_raw, DEFAULT_TCP_PORT, "tcp")
    }

    pub fn http_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .http_host
            .trim()
            .parse()
            .map_err(|e| format!("Invalid HTTP host {}: {}", self.http_host, e))?;
        Ok(SocketAddr::new(ip, self.http_port()))
    }

    /// TURN relay, when enabled and configured
    pub fn turn_server(&self) -> Option<TurnServer> {
        if !self.turn_enable {
            return None;
        }
        let Some(url) = self.turn_url.clone().filter(|url| !url.trim().is_empty()) else {
            tracing::warn!("TURN is enabled but TURN_URL is empty");
            return None;
        };
        Some(TurnServer::new(
            url,
            self.turn_username.clone().unwrap_or_default(),
            self.turn_password.clone().unwrap_or_default(),
        ))
    }

    pub fn webrtc_config(&self) -> WebRtcConfig {
        WebRtcConfig {
            turn_servers: self.turn_server().into_iter().collect(),
            udp_port: self.udp_port(),
            tcp_port: self.tcp_port(),
            nat_public_ip: self
                .nat_public_ip
                .clone()
                .filter(|ip| !ip.trim().is_empty()),
            gather_timeout: Duration::from_secs(self.ice_gather_timeout_secs),
            ..Default::default()
        }
    }

    pub fn hls_settings(&self) -> HlsSettings {
        let defaults = HlsSettings::default();
        HlsSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            hls_time: self.hls_time,
            list_size: self.hls_list_size,
            base_dir: self.hls_dir.clone().unwrap_or(defaults.base_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: IngestConfig,
    }

    fn parse(args: &[&str]) -> IngestConfig {
        let argv = std::iter::once("stream-ingest").chain(args.iter().copied());
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn test_invalid_ports_fall_back() {
        let config = parse(&["--udp-port", "70000", "--tcp-port", "abc", "--http-port", "9000"]);
        assert_eq!(config.udp_port(), DEFAULT_UDP_PORT);
        assert_eq!(config.tcp_port(), DEFAULT_TCP_PORT);
        assert_eq!(config.http_port(), 9000);
    }

    #[test]
    fn test_turn_requires_enable_and_url() {
        let config = parse(&["--turn-url", "turn:relay.example.com:3478"]);
        assert!(config.turn_server().is_none());

        let config = parse(&["--turn-enable", "true"]);
        assert!(config.turn_server().is_none());

        let config = parse(&[
            "--turn-enable",
            "yes",
            "--turn-url",
            "turn:relay.example.com:3478",
            "--turn-username",
            "user",
            "--turn-password",
            "secret",
        ]);
        let turn = config.turn_server().unwrap();
        assert_eq!(turn.urls, vec!["turn:relay.example.com:3478".to_string()]);
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "secret");
    }

    #[test]
    fn test_derived_settings() {
        let config = parse(&[
            "--hls-time",
            "2",
            "--hls-dir",
            "/tmp/hls",
            "--nat-public-ip",
            "203.0.113.7",
        ]);
        let hls = config.hls_settings();
        assert_eq!(hls.hls_time, 2);
        assert_eq!(hls.list_size, 8);
        assert_eq!(hls.base_dir, PathBuf::from("/tmp/hls"));

        let webrtc = config.webrtc_config();
        assert_eq!(webrtc.nat_public_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(webrtc.gather_timeout, Duration::from_secs(10));
        assert!(config.http_addr().is_ok());
    }
}
