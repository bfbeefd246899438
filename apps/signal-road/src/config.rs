use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use webrtc_rpc::config::DEFAULT_OFFER_DEADLINE;
use webrtc_rpc::QueueConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "signal-road")]
#[command(about = "Signaling server matching RPC callers with WebRTC hosts")]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8090)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Redis URL; selects the distributed call queue
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Seconds an offer waits for an answerer
    #[arg(long, env = "OFFER_DEADLINE_SECS", default_value_t = DEFAULT_OFFER_DEADLINE.as_secs())]
    pub offer_deadline_secs: u64,
}

impl Cli {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn offer_deadline(&self) -> Duration {
        Duration::from_secs(self.offer_deadline_secs.max(1))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default().with_offer_deadline(self.offer_deadline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "signal-road",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--offer-deadline-secs",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(cli.offer_deadline(), Duration::from_secs(1));
        assert_eq!(cli.queue_config().offer_deadline, Duration::from_secs(1));
    }
}
