//! Caller-side glue: negotiates a peer with a host and wraps it in a ready
//! [`ClientChannel`].

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::call_queue::OfferSignaler;
use crate::channel::ClientChannel;
use crate::config::{PeerOptions, SignalingEndpoint};
use crate::peer::{connect_client, PeerError};
use crate::signaling::{SignalingClient, SignalingError};
use crate::status::Status;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct DialOptions {
    pub host: String,
    pub signaling: SignalingEndpoint,
    pub peer: PeerOptions,
    pub timeout: Duration,
}

impl DialOptions {
    pub fn new(host: impl Into<String>, signaling: SignalingEndpoint) -> Self {
        Self {
            host: host.into(),
            signaling,
            peer: PeerOptions::default(),
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_peer_options(mut self, peer: PeerOptions) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("peer negotiation failed: {0}")]
    Peer(#[from] PeerError),
    #[error("channel never became ready: {0}")]
    Channel(#[from] Status),
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
    #[error("dial cancelled")]
    Cancelled,
}

/// Connects to `options.host` through the remote signaling service.
pub async fn dial(options: DialOptions) -> Result<ClientChannel, DialError> {
    let client = SignalingClient::new(options.signaling.clone())?;
    let cancel = CancellationToken::new();
    let timer = tokio::spawn({
        let cancel = cancel.clone();
        let timeout = options.timeout;
        async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        }
    });
    let result = dial_with(&client, &options.host, &options.peer, &cancel).await;
    let timed_out = cancel.is_cancelled();
    timer.abort();
    match result {
        Err(DialError::Cancelled | DialError::Peer(PeerError::Cancelled)) if timed_out => {
            Err(DialError::Timeout(options.timeout))
        }
        other => other,
    }
}

/// Connects to `host` through any signaler, such as an in-process call queue.
pub async fn dial_with(
    signaler: &dyn OfferSignaler,
    host: &str,
    options: &PeerOptions,
    cancel: &CancellationToken,
) -> Result<ClientChannel, DialError> {
    let peer = connect_client(options, signaler, host, cancel).await?;
    let channel = ClientChannel::new(peer);
    tokio::select! {
        ready = channel.ready() => ready?,
        _ = cancel.cancelled() => {
            channel.close();
            return Err(DialError::Cancelled);
        }
    }
    debug!(target: "webrtc", %host, "dialed");
    Ok(channel)
}
