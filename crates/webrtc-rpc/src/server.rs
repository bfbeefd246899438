//! Host-side glue: accepts offers, owns the resulting peers and serves the
//! registered methods on each of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::call_queue::IceCandidate;
use crate::channel::ServerChannel;
use crate::config::PeerOptions;
use crate::peer::{self, PeerTransport};
use crate::service::ServiceRegistry;
use crate::signaling::OfferAcceptor;
use crate::status::Status;

/// Tracks one [`ServerChannel`] per connected peer.
pub struct RpcServer {
    registry: Arc<ServiceRegistry>,
    options: PeerOptions,
    peers: Mutex<HashMap<u64, ServerChannel>>,
    next_peer: AtomicU64,
    shutdown: CancellationToken,
    this: Weak<RpcServer>,
}

impl RpcServer {
    pub fn new(registry: ServiceRegistry, options: PeerOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry: Arc::new(registry),
            options,
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Serves the registry over an already connected transport. Returns the
    /// peer id the channel is tracked under.
    pub async fn attach(&self, transport: Arc<dyn PeerTransport>) -> Result<u64, Status> {
        if self.shutdown.is_cancelled() {
            transport.close().await;
            return Err(Status::unavailable("server is stopped"));
        }
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let channel = ServerChannel::new(transport, self.registry.clone());
        let base = channel.base().clone();
        self.peers.lock().insert(id, channel);

        let this = self.this.clone();
        base.on_peer_done(move || {
            if let Some(server) = this.upgrade() {
                if server.peers.lock().remove(&id).is_some() {
                    debug!(target: "webrtc", peer_id = id, "peer done");
                }
            }
        });
        // stop() may have drained the set before the insert above
        if self.shutdown.is_cancelled() {
            base.close();
        }
        debug!(target: "webrtc", peer_id = id, "peer attached");
        Ok(id)
    }

    /// Stops accepting, closes every tracked channel and waits until each
    /// one has finished its stream tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let channels: Vec<ServerChannel> = self.peers.lock().drain().map(|(_, c)| c).collect();
        info!(target: "webrtc", peers = channels.len(), "stopping rpc server");
        for channel in &channels {
            channel.close();
        }
        for channel in &channels {
            channel.closed().await;
        }
    }
}

#[async_trait]
impl OfferAcceptor for RpcServer {
    async fn accept_offer(
        &self,
        uuid: &str,
        sdp: &str,
        candidates: mpsc::UnboundedReceiver<IceCandidate>,
        cancel: &CancellationToken,
    ) -> Result<String, Status> {
        if self.shutdown.is_cancelled() {
            return Err(Status::unavailable("server is stopped"));
        }
        let token = self.shutdown.child_token();
        let link = tokio::spawn({
            let cancel = cancel.clone();
            let token = token.clone();
            async move {
                cancel.cancelled().await;
                token.cancel();
            }
        });
        let accepted = peer::accept_offer(&self.options, sdp, candidates, &token).await;
        link.abort();

        let (peer, answer) = accepted.map_err(Status::from)?;
        let peer_id = self.attach(peer).await?;
        debug!(target: "webrtc", %uuid, peer_id, "offer accepted");
        Ok(answer)
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
