use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AnswerClientStream, AnswerRequest, AnswerResponse, SignalingError};
use crate::call_queue::IceCandidate;
use crate::status::Status;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Opens the answerer end of an `Answer` stream for a host.
#[async_trait]
pub trait AnswerConnector: Send + Sync + 'static {
    async fn connect(&self, host: &str) -> Result<Box<dyn AnswerClientStream>, SignalingError>;
}

/// Server-role half of a call: turns a caller's offer into an answer SDP.
///
/// `candidates` yields the caller's trickled candidates and closes once the
/// caller is done; it may outlive the call when the acceptor keeps applying
/// late candidates.
#[async_trait]
pub trait OfferAcceptor: Send + Sync + 'static {
    async fn accept_offer(
        &self,
        uuid: &str,
        sdp: &str,
        candidates: mpsc::UnboundedReceiver<IceCandidate>,
        cancel: &CancellationToken,
    ) -> Result<String, Status>;
}

/// Keeps one host reachable: holds an `Answer` stream open, redialing after
/// failures, and answers each offer through an [`OfferAcceptor`].
pub struct SignalingAnswerer {
    host: String,
    connector: Arc<dyn AnswerConnector>,
    acceptor: Arc<dyn OfferAcceptor>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Offer currently being established, or already answered and still
/// receiving late caller candidates.
struct Current {
    uuid: String,
    candidates: Option<mpsc::UnboundedSender<IceCandidate>>,
}

impl Current {
    fn route(&mut self, request: AnswerRequest) {
        match request {
            AnswerRequest::Update { uuid, candidate } if uuid == self.uuid => {
                if let Some(tx) = &self.candidates {
                    let _ = tx.send(candidate);
                }
            }
            AnswerRequest::Done { uuid } if uuid == self.uuid => {
                self.candidates = None;
            }
            other => {
                debug!(target: "signaling", uuid = %other.uuid(), "ignoring message for another offer");
            }
        }
    }
}

impl SignalingAnswerer {
    pub fn new(
        host: impl Into<String>,
        connector: Arc<dyn AnswerConnector>,
        acceptor: Arc<dyn OfferAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            connector,
            acceptor,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Spawns the answer loop; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let answerer = Arc::clone(self);
        *task = Some(tokio::spawn(async move { answerer.run().await }));
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: "signaling", host = %self.host, error = %err, "answer loop panicked");
            }
        }
    }

    async fn run(&self) {
        info!(target: "signaling", host = %self.host, "answerer started");
        while !self.shutdown.is_cancelled() {
            let result = match self.connector.connect(&self.host).await {
                Ok(mut stream) => self.serve(stream.as_mut()).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_expected() => {
                    debug!(target: "signaling", host = %self.host, error = %err, "answer stream ended; redialing");
                }
                Err(err) => {
                    warn!(target: "signaling", host = %self.host, error = %err, "answer stream failed; redialing");
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
        info!(target: "signaling", host = %self.host, "answerer stopped");
    }

    async fn serve(&self, stream: &mut dyn AnswerClientStream) -> Result<(), SignalingError> {
        let mut current: Option<Current> = None;
        let mut pending: Option<AnswerRequest> = None;
        loop {
            let request = match pending.take() {
                Some(request) => request,
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    request = stream.recv() => request?.ok_or(SignalingError::Disconnected)?,
                },
            };
            match request {
                AnswerRequest::Init {
                    uuid,
                    sdp,
                    disable_trickle,
                } => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let mut offer = Current {
                        uuid,
                        candidates: (!disable_trickle).then_some(tx),
                    };
                    pending = self.answer_offer(stream, &mut offer, &sdp, rx).await?;
                    current = Some(offer);
                }
                other => match current.as_mut() {
                    Some(current) => current.route(other),
                    None => {
                        debug!(target: "signaling", uuid = %other.uuid(), "candidate without an offer");
                    }
                },
            }
        }
    }

    /// Runs the acceptor while routing caller candidates to it. Returns an
    /// `Init` that superseded this offer before it was answered.
    async fn answer_offer(
        &self,
        stream: &mut dyn AnswerClientStream,
        offer: &mut Current,
        sdp: &str,
        candidates: mpsc::UnboundedReceiver<IceCandidate>,
    ) -> Result<Option<AnswerRequest>, SignalingError> {
        let uuid = offer.uuid.clone();
        debug!(target: "signaling", host = %self.host, %uuid, "offer received");
        let cancel = self.shutdown.child_token();
        let _guard = cancel.clone().drop_guard();
        let accept = self.acceptor.accept_offer(&uuid, sdp, candidates, &cancel);
        tokio::pin!(accept);

        let result = loop {
            tokio::select! {
                result = &mut accept => break result,
                request = stream.recv() => match request? {
                    None => return Err(SignalingError::Disconnected),
                    Some(next @ AnswerRequest::Init { .. }) => {
                        // the server gave up on this offer and moved on
                        debug!(target: "signaling", %uuid, "offer superseded before it was answered");
                        cancel.cancel();
                        let _ = accept.await;
                        return Ok(Some(next));
                    }
                    Some(request) => offer.route(request),
                },
            }
        };

        let response = match result {
            Ok(sdp) => AnswerResponse::Init {
                uuid: uuid.clone(),
                sdp,
            },
            Err(status) => {
                debug!(target: "signaling", %uuid, error = %status, "rejecting offer");
                AnswerResponse::Error {
                    uuid: uuid.clone(),
                    status,
                }
            }
        };
        stream.send(response).await?;
        Ok(None)
    }
}

impl Drop for SignalingAnswerer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
