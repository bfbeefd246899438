use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ConnectionState, PeerEvent, PeerTransport, TransportError, MAX_PACKET_BYTES};

/// One end of an in-process pipe that behaves like an open data channel.
///
/// Frames larger than `max_message_size` are refused, as a data channel
/// would, so the chunking path is exercised without WebRTC.
pub struct MemoryPeer {
    local: mpsc::UnboundedSender<PeerEvent>,
    remote: mpsc::UnboundedSender<PeerEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    closed: Arc<AtomicBool>,
    max_message_size: usize,
}

/// Two connected ends; both report `Open` immediately.
pub fn memory_pair() -> (Arc<MemoryPeer>, Arc<MemoryPeer>) {
    memory_pair_with_limit(MAX_PACKET_BYTES)
}

pub fn memory_pair_with_limit(max_message_size: usize) -> (Arc<MemoryPeer>, Arc<MemoryPeer>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let _ = a_tx.send(PeerEvent::ConnectionState(ConnectionState::Connected));
    let _ = a_tx.send(PeerEvent::Open);
    let _ = b_tx.send(PeerEvent::ConnectionState(ConnectionState::Connected));
    let _ = b_tx.send(PeerEvent::Open);
    let a = Arc::new(MemoryPeer {
        local: a_tx.clone(),
        remote: b_tx.clone(),
        events: Mutex::new(Some(a_rx)),
        closed: closed.clone(),
        max_message_size,
    });
    let b = Arc::new(MemoryPeer {
        local: b_tx,
        remote: a_tx,
        events: Mutex::new(Some(b_rx)),
        closed,
        max_message_size,
    });
    (a, b)
}

impl MemoryPeer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulates the remote side failing without a clean close.
    pub fn fail(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for side in [&self.local, &self.remote] {
            let _ = side.send(PeerEvent::ConnectionState(ConnectionState::Failed));
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryPeer {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        self.remote
            .send(PeerEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for side in [&self.local, &self.remote] {
            let _ = side.send(PeerEvent::Closed);
            let _ = side.send(PeerEvent::ConnectionState(ConnectionState::Closed));
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn frames_cross_and_close_reaches_both_ends() {
        let (a, b) = memory_pair();
        let mut b_events = b.take_events().unwrap();
        assert!(b.take_events().is_none());
        assert_eq!(
            b_events.recv().await,
            Some(PeerEvent::ConnectionState(ConnectionState::Connected))
        );
        assert_eq!(b_events.recv().await, Some(PeerEvent::Open));

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(PeerEvent::Message(Bytes::from_static(b"ping")))
        );

        a.close().await;
        assert_eq!(b_events.recv().await, Some(PeerEvent::Closed));
        assert_eq!(
            b.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn oversized_frames_are_refused() {
        let (a, _b) = memory_pair_with_limit(8);
        let err = a.send(Bytes::from(vec![0u8; 9])).await.unwrap_err();
        assert_eq!(err, TransportError::MessageTooLarge { size: 9, limit: 8 });
    }
}
