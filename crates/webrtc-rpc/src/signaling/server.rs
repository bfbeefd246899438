use std::sync::Arc;

use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    require_host, AnswerRequest, AnswerResponse, AnswerServerStream, CallRequest, CallResponse,
    SignalingError,
};
use crate::call_queue::{CallAnswer, CallQueue, IceCandidate, OfferExchange, QueueError};
use crate::status::Status;

/// Matches callers with the answerer currently serving their host.
pub struct SignalingServer {
    queue: Arc<dyn CallQueue>,
    shutdown: CancellationToken,
}

enum Step {
    CallerCandidate(Option<IceCandidate>),
    Reply(Result<Option<AnswerResponse>, SignalingError>),
    Deadline,
    Shutdown,
}

enum Outcome {
    Answered,
    Rejected,
    Abandoned,
}

impl SignalingServer {
    pub fn new(queue: Arc<dyn CallQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn queue(&self) -> &Arc<dyn CallQueue> {
        &self.queue
    }

    /// Token cancelled by [`SignalingServer::shutdown`]; per-request tokens
    /// should be children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Ends every `Answer` loop and closes the queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(err) = self.queue.close().await {
            warn!(target: "signaling", error = %err, "closing call queue failed");
        }
    }

    /// Forwards one complete offer to `host` and waits for its answer.
    pub async fn call(
        &self,
        host: Option<&str>,
        request: CallRequest,
        cancel: &CancellationToken,
    ) -> Result<CallResponse, Status> {
        let host = require_host(host).map_err(|err| err.to_status())?;
        debug!(target: "signaling", %host, "call received");
        let sdp = self
            .queue
            .send_offer(host, &request.sdp, cancel)
            .await
            .map_err(Status::from)?;
        Ok(CallResponse { sdp })
    }

    /// Serves one answerer: pushes every offer for `host` down `stream` and
    /// relays the reply. Returns when the stream breaks or `cancel` fires.
    pub async fn answer<S>(
        &self,
        host: Option<&str>,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError>
    where
        S: AnswerServerStream + ?Sized,
    {
        let host = require_host(host)?;
        info!(target: "signaling", %host, "answerer connected");
        loop {
            let exchange = tokio::select! {
                offer = self.queue.recv_offer(host, cancel) => match offer {
                    Ok(exchange) => exchange,
                    Err(QueueError::Cancelled) => return Ok(()),
                    Err(err) => return Err(err.into()),
                },
                reply = stream.recv() => match reply {
                    Ok(Some(reply)) => {
                        debug!(target: "signaling", %host, uuid = %reply.uuid(), "ignoring reply while idle");
                        continue;
                    }
                    Ok(None) => return Err(SignalingError::Disconnected),
                    Err(err) => return Err(err),
                },
            };
            self.serve_offer(host, exchange, stream, cancel).await?;
        }
    }

    async fn serve_offer<S>(
        &self,
        host: &str,
        mut exchange: OfferExchange,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError>
    where
        S: AnswerServerStream + ?Sized,
    {
        let uuid = exchange.uuid().to_string();
        let deadline = exchange.deadline();
        debug!(target: "signaling", %host, %uuid, "offer handed to answerer");
        let init = AnswerRequest::Init {
            uuid: uuid.clone(),
            sdp: exchange.sdp().to_string(),
            disable_trickle: exchange.disable_trickle(),
        };
        if let Err(err) = stream.send(init).await {
            disconnected(&exchange, &err).await;
            return Err(SignalingError::Disconnected);
        }

        let mut caller_done = false;
        let outcome = loop {
            let step = tokio::select! {
                candidate = exchange.next_caller_candidate(), if !caller_done => {
                    Step::CallerCandidate(candidate)
                }
                reply = stream.recv() => Step::Reply(reply),
                _ = sleep_until(deadline) => Step::Deadline,
                _ = cancel.cancelled() => Step::Shutdown,
            };
            match step {
                Step::CallerCandidate(candidate) => {
                    let request = match candidate {
                        Some(candidate) => AnswerRequest::Update {
                            uuid: uuid.clone(),
                            candidate,
                        },
                        None => {
                            caller_done = true;
                            AnswerRequest::Done { uuid: uuid.clone() }
                        }
                    };
                    if let Err(err) = stream.send(request).await {
                        disconnected(&exchange, &err).await;
                        return Err(SignalingError::Disconnected);
                    }
                }
                Step::Reply(Ok(Some(reply))) if reply.uuid() != uuid => {
                    debug!(target: "signaling", %uuid, stale = %reply.uuid(), "ignoring reply to an earlier offer");
                }
                Step::Reply(Ok(Some(AnswerResponse::Init { sdp, .. }))) => {
                    respond(&exchange, CallAnswer::Init(sdp)).await;
                    if let Err(err) = exchange.answerer_done().await {
                        debug!(target: "signaling", %uuid, error = %err, "could not mark answerer done");
                    }
                    break Outcome::Answered;
                }
                Step::Reply(Ok(Some(AnswerResponse::Error { status, .. }))) => {
                    debug!(target: "signaling", %uuid, error = %status, "answerer rejected offer");
                    respond(&exchange, CallAnswer::Error(status.message().to_string())).await;
                    break Outcome::Rejected;
                }
                Step::Reply(Ok(None)) => {
                    disconnected(&exchange, &SignalingError::Disconnected).await;
                    return Err(SignalingError::Disconnected);
                }
                Step::Reply(Err(err)) => {
                    disconnected(&exchange, &err).await;
                    return Err(err);
                }
                Step::Deadline => {
                    debug!(target: "signaling", %uuid, "answerer did not reply before the deadline");
                    break Outcome::Abandoned;
                }
                Step::Shutdown => {
                    respond(
                        &exchange,
                        CallAnswer::Error("signaling server shutting down".into()),
                    )
                    .await;
                    return Ok(());
                }
            }
        };

        if matches!(outcome, Outcome::Answered) && !caller_done {
            self.forward_remaining(&uuid, &mut exchange, stream, cancel)
                .await?;
        }
        Ok(())
    }

    /// Caller candidates that trickle in after the answer still reach the
    /// answerer, until the caller is done or the exchange expires.
    async fn forward_remaining<S>(
        &self,
        uuid: &str,
        exchange: &mut OfferExchange,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError>
    where
        S: AnswerServerStream + ?Sized,
    {
        let deadline = exchange.deadline();
        loop {
            let candidate = tokio::select! {
                candidate = exchange.next_caller_candidate() => candidate,
                _ = sleep_until(deadline) => return Ok(()),
                _ = cancel.cancelled() => return Ok(()),
            };
            let request = match candidate {
                Some(candidate) => AnswerRequest::Update {
                    uuid: uuid.to_string(),
                    candidate,
                },
                None => {
                    stream
                        .send(AnswerRequest::Done {
                            uuid: uuid.to_string(),
                        })
                        .await?;
                    return Ok(());
                }
            };
            stream.send(request).await?;
        }
    }
}

async fn respond(exchange: &OfferExchange, answer: CallAnswer) {
    if let Err(err) = exchange.respond(answer).await {
        debug!(target: "signaling", uuid = %exchange.uuid(), error = %err, "caller no longer listening");
    }
}

async fn disconnected(exchange: &OfferExchange, err: &SignalingError) {
    debug!(target: "signaling", uuid = %exchange.uuid(), error = %err, "answerer stream broke");
    respond(
        exchange,
        CallAnswer::Error(format!("answerer disconnected: {err}")),
    )
    .await;
}
