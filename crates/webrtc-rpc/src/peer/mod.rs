//! Peer connections: the transport abstraction the channel layer runs on and
//! the procedures that negotiate a WebRTC data channel through a signaler.

mod memory;
pub mod sdp;
pub mod session;
mod rtc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::call_queue::QueueError;
use crate::status::Status;

pub use self::memory::{memory_pair, memory_pair_with_limit, MemoryPeer};
pub use self::session::{accept_offer, connect_client};
pub use self::rtc::WebRtcPeer;

/// Largest frame handed to a data channel in one message.
pub const MAX_PACKET_BYTES: usize = 16 * 1024;

/// Label of the pre-negotiated data channel both sides open with id 0.
pub const DATA_CHANNEL_LABEL: &str = "data";
pub const DATA_CHANNEL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer connection will not carry traffic again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Open,
    Message(Bytes),
    Error(String),
    Closed,
    ConnectionState(ConnectionState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("webrtc error: {0}")]
    WebRtc(String),
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        Status::unavailable(err.to_string())
    }
}

/// A single ordered, reliable binary pipe to one remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Hands out the event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Closes the pipe and the connection under it. Idempotent.
    async fn close(&self);

    fn max_message_size(&self) -> usize {
        MAX_PACKET_BYTES
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
    #[error("invalid session description: {0}")]
    Sdp(String),
    #[error("call queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("offer rejected: {0}")]
    Rejected(String),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("negotiation deadline exceeded")]
    DeadlineExceeded,
    #[error("peer connection has no local description")]
    NoLocalDescription,
}

impl From<PeerError> for Status {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Queue(err) => err.into(),
            PeerError::Cancelled => Status::cancelled(err.to_string()),
            PeerError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            PeerError::Sdp(_) => Status::invalid_argument(err.to_string()),
            PeerError::Rejected(_) => Status::unknown(err.to_string()),
            PeerError::WebRtc(_) | PeerError::NoLocalDescription => {
                Status::internal(err.to_string())
            }
        }
    }
}
