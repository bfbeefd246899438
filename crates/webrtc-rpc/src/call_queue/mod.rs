//! Rendezvous between callers and hosts for SDP / ICE candidate exchange.
//!
//! A caller pushes an offer for a host with [`OfferSignaler::send_offer_init`]
//! (or the one-shot [`OfferSignaler::send_offer`]); the host's answerer
//! claims it with [`CallQueue::recv_offer`] and replies through the returned
//! [`OfferExchange`]. Two backends implement the same contract: the in-process
//! [`MemoryCallQueue`] and the document-store backed [`DistributedCallQueue`].

mod distributed;
mod document;
mod memory;
#[cfg(feature = "redis-queue")]
mod redis_store;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::DEFAULT_OFFER_DEADLINE;
use crate::status::Status;

pub use distributed::DistributedCallQueue;
pub use document::{
    AnswererSide, CallerSide, DocumentUpdate, ExchangeDocument, IllegalTransition, SidePhase,
};
pub use memory::MemoryCallQueue;
#[cfg(feature = "redis-queue")]
pub use redis_store::RedisDocumentStore;
pub use store::{
    ChangeEvent, ChangeKind, ChangeStream, DocumentStore, MemoryDocumentStore, ResumeToken,
    StoreError, WatchFilter,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("offer deadline exceeded")]
    DeadlineExceeded,
    #[error("operation cancelled")]
    Cancelled,
    #[error("call queue closed")]
    Closed,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("answerer error: {0}")]
    Answerer(String),
    #[error("no active exchange {0}")]
    UnknownExchange(String),
    #[error("exchange {0} already finished")]
    ExchangeFinished(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("signaling unavailable: {0}")]
    Unavailable(String),
    #[error("{0} is not supported by this signaler")]
    Unsupported(&'static str),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueueError::UnknownExchange(id),
            StoreError::Illegal { id, .. } => QueueError::ExchangeFinished(id),
            other => QueueError::Store(other.to_string()),
        }
    }
}

impl From<QueueError> for Status {
    fn from(err: QueueError) -> Self {
        match &err {
            QueueError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            QueueError::Cancelled => Status::cancelled(err.to_string()),
            QueueError::Closed => Status::unavailable(err.to_string()),
            QueueError::EmptyHost => Status::invalid_argument(err.to_string()),
            QueueError::Answerer(_) => Status::unknown(err.to_string()),
            QueueError::UnknownExchange(_) | QueueError::ExchangeFinished(_) => {
                Status::new(crate::status::Code::FailedPrecondition, err.to_string())
            }
            QueueError::Store(_) => Status::internal(err.to_string()),
            QueueError::Unavailable(_) => Status::unavailable(err.to_string()),
            QueueError::Unsupported(_) => Status::unimplemented(err.to_string()),
        }
    }
}

/// One trickled ICE candidate, as produced by `RTCIceCandidate::to_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// One unit of the answerer -> caller return path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAnswer {
    Init(String),
    Candidate(IceCandidate),
    Error(String),
}

/// The caller's half of an offer as seen by the receiving side.
#[derive(Debug, Clone)]
pub struct CallOffer {
    pub uuid: String,
    pub host: String,
    pub sdp: String,
    pub disable_trickle: bool,
    pub deadline: Instant,
}

/// Caller-side handle returned by [`OfferSignaler::send_offer_init`].
///
/// Dropping the handle cancels the exchange.
pub struct OfferHandle {
    uuid: String,
    answers: mpsc::UnboundedReceiver<CallAnswer>,
    answerer_done: CancellationToken,
    cancel: CancellationToken,
    deadline: Instant,
}

impl OfferHandle {
    pub(crate) fn new(
        uuid: String,
        answers: mpsc::UnboundedReceiver<CallAnswer>,
        answerer_done: CancellationToken,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            uuid,
            answers,
            answerer_done,
            cancel,
            deadline,
        }
    }

    /// A handle whose single answer is already known, for signalers that
    /// carry one request/response pair.
    pub(crate) fn resolved(uuid: String, answer: CallAnswer) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(answer);
        let done = CancellationToken::new();
        done.cancel();
        Self::new(
            uuid,
            rx,
            done,
            CancellationToken::new(),
            Instant::now() + DEFAULT_OFFER_DEADLINE,
        )
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn answerer_done(&self) -> &CancellationToken {
        &self.answerer_done
    }

    /// Next answer from the answerer; `Ok(None)` once it is done and every
    /// queued answer was consumed.
    pub async fn next_answer(&mut self) -> Result<Option<CallAnswer>, QueueError> {
        tokio::select! {
            biased;
            answer = self.answers.recv() => Ok(answer),
            _ = self.answerer_done.cancelled() => match self.answers.try_recv() {
                Ok(answer) => Ok(Some(answer)),
                Err(_) if self.cancel.is_cancelled() => Err(QueueError::Cancelled),
                Err(_) if Instant::now() >= self.deadline => Err(QueueError::DeadlineExceeded),
                Err(_) => Ok(None),
            },
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            _ = sleep_until(self.deadline) => Err(QueueError::DeadlineExceeded),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for OfferHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Backend-specific delivery of the answerer's replies.
#[async_trait]
pub(crate) trait AnswerSink: Send + Sync {
    async fn respond(&self, answer: CallAnswer) -> Result<(), QueueError>;
    async fn done(&self) -> Result<(), QueueError>;
}

/// Receiver-side handle for one claimed offer.
pub struct OfferExchange {
    offer: CallOffer,
    caller_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    caller_done: CancellationToken,
    caller_error: Arc<Mutex<Option<String>>>,
    sink: Arc<dyn AnswerSink>,
    _feed: Option<DropGuard>,
}

impl OfferExchange {
    pub(crate) fn new(
        offer: CallOffer,
        caller_candidates: mpsc::UnboundedReceiver<IceCandidate>,
        caller_done: CancellationToken,
        caller_error: Arc<Mutex<Option<String>>>,
        sink: Arc<dyn AnswerSink>,
        feed: Option<DropGuard>,
    ) -> Self {
        Self {
            offer,
            caller_candidates,
            caller_done,
            caller_error,
            sink,
            _feed: feed,
        }
    }

    pub fn offer(&self) -> &CallOffer {
        &self.offer
    }

    pub fn uuid(&self) -> &str {
        &self.offer.uuid
    }

    pub fn host(&self) -> &str {
        &self.offer.host
    }

    pub fn sdp(&self) -> &str {
        &self.offer.sdp
    }

    pub fn disable_trickle(&self) -> bool {
        self.offer.disable_trickle
    }

    pub fn deadline(&self) -> Instant {
        self.offer.deadline
    }

    /// Next candidate trickled by the caller; `None` once the caller is done.
    pub async fn next_caller_candidate(&mut self) -> Option<IceCandidate> {
        tokio::select! {
            biased;
            candidate = self.caller_candidates.recv() => candidate,
            _ = self.caller_done.cancelled() => self.caller_candidates.try_recv().ok(),
        }
    }

    pub fn caller_done(&self) -> &CancellationToken {
        &self.caller_done
    }

    pub fn caller_error(&self) -> Option<String> {
        self.caller_error.lock().clone()
    }

    pub async fn respond(&self, answer: CallAnswer) -> Result<(), QueueError> {
        self.sink.respond(answer).await
    }

    pub async fn answerer_done(&self) -> Result<(), QueueError> {
        self.sink.done().await
    }
}

/// Caller side of the rendezvous.
#[async_trait]
pub trait OfferSignaler: Send + Sync {
    /// Whether candidates may be trickled after the initial SDP.
    fn supports_trickle(&self) -> bool {
        true
    }

    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
        cancel: &CancellationToken,
    ) -> Result<OfferHandle, QueueError>;

    async fn send_offer_update(
        &self,
        host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), QueueError>;

    async fn send_offer_done(&self, host: &str, uuid: &str) -> Result<(), QueueError>;

    async fn send_offer_error(&self, host: &str, uuid: &str, error: &str)
    -> Result<(), QueueError>;

    /// Sends a complete SDP and waits for the answerer's SDP.
    async fn send_offer(
        &self,
        host: &str,
        sdp: &str,
        cancel: &CancellationToken,
    ) -> Result<String, QueueError> {
        let mut handle = self.send_offer_init(host, sdp, true, cancel).await?;
        loop {
            let answer = tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                answer = handle.next_answer() => answer?,
            };
            match answer {
                Some(CallAnswer::Init(sdp)) => return Ok(sdp),
                Some(CallAnswer::Error(err)) => return Err(QueueError::Answerer(err)),
                Some(CallAnswer::Candidate(_)) => continue,
                None => {
                    return Err(QueueError::Answerer(
                        "answerer finished without an answer".into(),
                    ));
                }
            }
        }
    }
}

/// Receiving side of the rendezvous, implemented by both backends.
#[async_trait]
pub trait CallQueue: OfferSignaler {
    async fn recv_offer(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<OfferExchange, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

pub(crate) fn ensure_host(host: &str) -> Result<(), QueueError> {
    if host.is_empty() {
        return Err(QueueError::EmptyHost);
    }
    Ok(())
}
