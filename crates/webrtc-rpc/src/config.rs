use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Offers not answered within this window are abandoned.
pub const DEFAULT_OFFER_DEADLINE: Duration = Duration::from_secs(10);

/// Settings for the local side of a peer connection.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Send one complete SDP instead of trickling candidates
    pub disable_trickle: bool,
    /// Longest wait for local ICE gathering before an answer is given up
    pub gather_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            disable_trickle: false,
            gather_timeout: DEFAULT_OFFER_DEADLINE,
        }
    }
}

impl PeerOptions {
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(servers) = env::var("WEBRTC_RPC_ICE_SERVERS") {
            let urls: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            options.ice_servers = if urls.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls,
                    ..Default::default()
                }]
            };
        }
        if env_flag("WEBRTC_RPC_DISABLE_STUN") {
            options.ice_servers.clear();
        }
        options.disable_trickle = env_flag("WEBRTC_RPC_DISABLE_TRICKLE");
        options
    }

    /// No STUN/TURN; only host candidates are gathered.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_disable_trickle(mut self, disable_trickle: bool) -> Self {
        self.disable_trickle = disable_trickle;
        self
    }

    pub fn with_gather_timeout(mut self, gather_timeout: Duration) -> Self {
        self.gather_timeout = gather_timeout;
        self
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}

/// Where the signaling service lives and whether to reach it without TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub address: String,
    pub insecure: bool,
}

impl SignalingEndpoint {
    pub fn new(address: impl Into<String>, insecure: bool) -> Self {
        Self {
            address: address.into(),
            insecure,
        }
    }

    pub fn from_env() -> Option<Self> {
        let address = env::var("WEBRTC_RPC_SIGNALING_ADDR").ok()?;
        Some(Self::new(address, env_flag("WEBRTC_RPC_SIGNALING_INSECURE")))
    }

    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{}{path}", self.address.trim_end_matches('/'))
    }

    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.insecure { "ws" } else { "wss" };
        format!("{scheme}://{}{path}", self.address.trim_end_matches('/'))
    }
}

/// Timing knobs shared by both call queue backends.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub offer_deadline: Duration,
    /// How long an idle host entry survives before the sweeper drops it.
    pub host_idle: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            offer_deadline: DEFAULT_OFFER_DEADLINE,
            host_idle: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn with_offer_deadline(mut self, offer_deadline: Duration) -> Self {
        self.offer_deadline = offer_deadline;
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn endpoint_urls_follow_insecure_flag() {
        let secure = SignalingEndpoint::new("signal.example.com/", false);
        assert_eq!(
            secure.http_url("/rpc/signaling/call"),
            "https://signal.example.com/rpc/signaling/call"
        );
        assert_eq!(
            secure.ws_url("/rpc/signaling/answer"),
            "wss://signal.example.com/rpc/signaling/answer"
        );

        let insecure = SignalingEndpoint::new("127.0.0.1:8090", true);
        assert_eq!(insecure.http_url("/x"), "http://127.0.0.1:8090/x");
        assert_eq!(insecure.ws_url("/x"), "ws://127.0.0.1:8090/x");
    }

    #[test_timeout::timeout]
    fn localhost_options_have_no_ice_servers() {
        assert!(PeerOptions::localhost().ice_servers.is_empty());
        assert_eq!(PeerOptions::default().ice_servers.len(), 1);
        assert_eq!(
            PeerOptions::localhost().gather_timeout,
            DEFAULT_OFFER_DEADLINE
        );
    }
}
