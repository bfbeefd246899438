use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::{ConnectionState, PeerEvent, PeerTransport, TransportError};

/// A negotiated WebRTC data channel and the peer connection carrying it.
///
/// Engine callbacks only push into an unbounded queue; nothing reacts to an
/// event while the engine is still inside its callback.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    attached: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub(crate) fn new(
        peer_connection: Arc<RTCPeerConnection>,
        data_channel: Arc<RTCDataChannel>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let attached = Arc::new(AtomicBool::new(false));
        subscribe(&peer_connection, &data_channel, &events_tx, &attached);
        Arc::new(Self {
            peer_connection,
            data_channel,
            events: Mutex::new(Some(events_rx)),
            events_tx,
            attached,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    pub fn data_channel(&self) -> &Arc<RTCDataChannel> {
        &self.data_channel
    }
}

fn subscribe(
    peer_connection: &Arc<RTCPeerConnection>,
    data_channel: &Arc<RTCDataChannel>,
    events_tx: &mpsc::UnboundedSender<PeerEvent>,
    attached: &Arc<AtomicBool>,
) {
    let tx = events_tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            debug!(target: "webrtc", ?state, "peer connection state changed");
            let _ = tx.send(PeerEvent::ConnectionState(state.into()));
            Box::pin(async {})
        },
    ));

    let tx = events_tx.clone();
    data_channel.on_open(Box::new(move || {
        debug!(target: "webrtc", "data channel open");
        let _ = tx.send(PeerEvent::Open);
        Box::pin(async {})
    }));

    let tx = events_tx.clone();
    data_channel.on_close(Box::new(move || {
        debug!(target: "webrtc", "data channel closed");
        let _ = tx.send(PeerEvent::Closed);
        Box::pin(async {})
    }));

    let tx = events_tx.clone();
    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        trace!(target: "webrtc", bytes = msg.data.len(), "data channel message");
        let _ = tx.send(PeerEvent::Message(msg.data));
        Box::pin(async {})
    }));

    // Nothing above the data channel can report an error until a channel
    // has taken the events, so the connection is torn down right here.
    let tx = events_tx.clone();
    let attached = attached.clone();
    let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(peer_connection);
    data_channel.on_error(Box::new(move |err: webrtc::Error| {
        let message = err.to_string();
        let _ = tx.send(PeerEvent::Error(message.clone()));
        let attached = attached.load(Ordering::Acquire);
        let weak_pc = weak_pc.clone();
        Box::pin(async move {
            if attached {
                return;
            }
            warn!(target: "webrtc", error = %message, "data channel error before attach; closing peer connection");
            if let Some(pc) = weak_pc.upgrade() {
                if let Err(err) = pc.close().await {
                    debug!(target: "webrtc", error = %err, "closing peer connection failed");
                }
            }
        })
    }));
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let limit = self.max_message_size();
        if frame.len() > limit {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                limit,
            });
        }
        self.data_channel
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::WebRtc(err.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        let events = self.events.lock().take();
        if events.is_some() {
            self.attached.store(true, Ordering::Release);
        }
        events
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.data_channel.close().await {
            debug!(target: "webrtc", error = %err, "closing data channel failed");
        }
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "webrtc", error = %err, "closing peer connection failed");
        }
        let _ = self
            .events_tx
            .send(PeerEvent::ConnectionState(ConnectionState::Closed));
    }
}
