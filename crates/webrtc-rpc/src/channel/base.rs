use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::wire::FRAME_OVERHEAD;
use crate::peer::{PeerEvent, PeerTransport};
use crate::status::Status;

/// Receives every inbound frame of a channel, in arrival order.
#[async_trait]
pub(crate) trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, frame: Bytes);

    /// Runs once during teardown, before the transport is closed.
    async fn on_channel_closed(&self, reason: &Status);
}

type PeerDone = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PeerDoneSlot {
    callback: Option<PeerDone>,
    fired: bool,
}

/// Readiness, closure and event dispatch shared by both channel roles.
pub struct BaseChannel {
    transport: Arc<dyn PeerTransport>,
    ready: watch::Sender<bool>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    done: CancellationToken,
    peer_done: Mutex<PeerDoneSlot>,
}

impl BaseChannel {
    pub(crate) fn new(transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            ready,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            done: CancellationToken::new(),
            peer_done: Mutex::new(PeerDoneSlot::default()),
        })
    }

    /// Spawns the dispatcher. It exits, and drops its references, once the
    /// channel is closed.
    pub(crate) fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let events = self.transport.take_events();
        let base = Arc::clone(self);
        tokio::spawn(async move {
            match events {
                Some(events) => base.dispatch(events, &handler).await,
                None => base.close_with("transport events already taken"),
            }
            base.teardown(&handler).await;
        });
    }

    async fn dispatch(
        &self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        handler: &Arc<dyn FrameHandler>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(PeerEvent::Open) => {
                    debug!(target: "channel", "data channel ready");
                    self.ready.send_replace(true);
                }
                Some(PeerEvent::Message(frame)) => {
                    trace!(target: "channel", bytes = frame.len(), "frame received");
                    handler.on_frame(frame).await;
                }
                Some(PeerEvent::Error(err)) => {
                    self.close_with(format!("data channel error: {err}"));
                }
                Some(PeerEvent::Closed) => self.close_with("data channel closed"),
                Some(PeerEvent::ConnectionState(state)) if state.is_terminal() => {
                    self.close_with(format!("peer connection {state:?}").to_lowercase());
                }
                Some(PeerEvent::ConnectionState(state)) => {
                    trace!(target: "channel", ?state, "connection state");
                }
                None => self.close_with("transport event stream ended"),
            }
        }
    }

    async fn teardown(&self, handler: &Arc<dyn FrameHandler>) {
        let status = self.closed_status();
        debug!(target: "channel", reason = %status.message(), "channel closing");
        handler.on_channel_closed(&status).await;
        self.transport.close().await;
        self.fire_peer_done();
        self.done.cancel();
    }

    fn fire_peer_done(&self) {
        let callback = {
            let mut slot = self.peer_done.lock();
            slot.fired = true;
            slot.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Registers the owner's cleanup hook. It runs exactly once, when the
    /// peer connection is gone or the channel was closed, whichever is first.
    pub fn on_peer_done(&self, callback: impl FnOnce() + Send + 'static) {
        let mut slot = self.peer_done.lock();
        if slot.fired {
            drop(slot);
            callback();
            return;
        }
        slot.callback = Some(Box::new(callback));
    }

    pub async fn ready(&self) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(self.closed_status());
        }
        let mut ready = self.ready.subscribe();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_status()),
            result = ready.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| self.closed_status())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) async fn write_frame(&self, frame: Bytes) -> Result<(), Status> {
        self.ready().await?;
        self.transport.send(frame).await.map_err(Status::from)
    }

    /// Largest message slice that still fits one frame on this transport.
    pub(crate) fn chunk_size(&self) -> usize {
        self.transport
            .max_message_size()
            .saturating_sub(FRAME_OVERHEAD)
            .max(1)
    }

    /// Closes the channel. Only the first reason is kept.
    pub fn close(&self) {
        self.close_with("channel closed");
    }

    pub(crate) fn close_with(&self, reason: impl Into<String>) {
        let mut slot = self.close_reason.lock();
        if self.closed.is_cancelled() {
            return;
        }
        *slot = Some(reason.into());
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn closed_status(&self) -> Status {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "channel closed".to_string());
        Status::unavailable(reason)
    }

    /// Resolves after teardown has finished.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }
}
