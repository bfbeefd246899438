use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::document::{AnswererSide, DocumentUpdate, ExchangeDocument, SidePhase};
use super::store::{DocumentStore, WatchFilter};
use super::{
    ensure_host, AnswerSink, CallAnswer, CallOffer, CallQueue, IceCandidate, OfferExchange,
    OfferHandle, OfferSignaler, QueueError,
};

/// Call queue persisted in a [`DocumentStore`], so callers and answerers may
/// live in different processes.
///
/// Matching relies on the store's change feed. A receiver watches for
/// inserts before polling once for older documents, which narrows but does
/// not close the window in which a slow feed delivers an insert late.
pub struct DistributedCallQueue {
    store: Arc<dyn DocumentStore>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl DistributedCallQueue {
    pub fn new(store: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn deadline_for(&self, doc: &ExchangeDocument) -> Instant {
        let age = Utc::now()
            .signed_duration_since(doc.started_at)
            .to_std()
            .unwrap_or_default();
        Instant::now() + self.store.ttl().saturating_sub(age)
    }

    async fn update(&self, uuid: &str, update: DocumentUpdate) -> Result<(), QueueError> {
        self.store.update(uuid, update).await?;
        Ok(())
    }
}

/// What the caller already saw of the answerer's side.
#[derive(Default)]
struct AnswerProgress {
    answered: bool,
    candidates: usize,
}

impl AnswerProgress {
    /// Emits the answers `doc` adds; returns true once the answerer finished.
    fn observe(&mut self, doc: &ExchangeDocument, out: &mpsc::UnboundedSender<CallAnswer>) -> bool {
        match &doc.answerer {
            AnswererSide::Unanswered => false,
            AnswererSide::Failed { error } => {
                let _ = out.send(CallAnswer::Error(error.clone()));
                true
            }
            AnswererSide::Answered {
                sdp,
                candidates,
                phase,
            } => {
                if !self.answered {
                    self.answered = true;
                    let _ = out.send(CallAnswer::Init(sdp.clone()));
                }
                for candidate in candidates.iter().skip(self.candidates) {
                    let _ = out.send(CallAnswer::Candidate(candidate.clone()));
                }
                self.candidates = self.candidates.max(candidates.len());
                match phase {
                    SidePhase::Active => false,
                    SidePhase::Done => true,
                    SidePhase::Failed(error) => {
                        let _ = out.send(CallAnswer::Error(error.clone()));
                        true
                    }
                }
            }
        }
    }
}

/// What the answerer already saw of the caller's side.
struct CallerProgress {
    candidates: usize,
    out: mpsc::UnboundedSender<IceCandidate>,
    done: CancellationToken,
    error: Arc<Mutex<Option<String>>>,
}

impl CallerProgress {
    fn observe(&mut self, doc: &ExchangeDocument) -> bool {
        for candidate in doc.caller.candidates.iter().skip(self.candidates) {
            let _ = self.out.send(candidate.clone());
        }
        self.candidates = self.candidates.max(doc.caller.candidates.len());
        match &doc.caller.phase {
            SidePhase::Active => false,
            SidePhase::Done => {
                self.done.cancel();
                true
            }
            SidePhase::Failed(error) => {
                *self.error.lock() = Some(error.clone());
                self.done.cancel();
                true
            }
        }
    }
}

struct StoreAnswerSink {
    store: Arc<dyn DocumentStore>,
    id: String,
}

#[async_trait]
impl AnswerSink for StoreAnswerSink {
    async fn respond(&self, answer: CallAnswer) -> Result<(), QueueError> {
        let update = match answer {
            CallAnswer::Init(sdp) => DocumentUpdate::AnswererInit { sdp },
            CallAnswer::Candidate(candidate) => DocumentUpdate::AnswererCandidate { candidate },
            CallAnswer::Error(error) => DocumentUpdate::AnswererError { error },
        };
        self.store.update(&self.id, update).await?;
        Ok(())
    }

    async fn done(&self) -> Result<(), QueueError> {
        self.store
            .update(&self.id, DocumentUpdate::AnswererDone)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OfferSignaler for DistributedCallQueue {
    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
        cancel: &CancellationToken,
    ) -> Result<OfferHandle, QueueError> {
        ensure_host(host)?;
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.store.ttl();
        let record = async {
            // subscribe first so no answer can slip in before the watch exists
            let feed = self
                .store
                .watch(host, WatchFilter::Updates { id: id.clone() }, None)
                .await?;
            let doc = ExchangeDocument::new(
                id.clone(),
                host.to_string(),
                sdp.to_string(),
                disable_trickle,
                Utc::now(),
            );
            self.store.insert(doc).await?;
            Ok::<_, QueueError>(feed)
        };
        let mut feed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            _ = self.closed.cancelled() => return Err(QueueError::Closed),
            feed = record => feed?,
        };
        debug!(target: "call_queue", %host, uuid = %id, "offer recorded");

        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        let answerer_done = CancellationToken::new();
        let handle_cancel = cancel.child_token();

        let stop = handle_cancel.clone();
        let closed = self.closed.clone();
        let done = answerer_done.clone();
        let uuid = id.clone();
        self.tasks.spawn(async move {
            let mut progress = AnswerProgress::default();
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = sleep_until(deadline) => break,
                    event = feed.next() => event,
                };
                match event {
                    None => break,
                    Some(Err(err)) => {
                        warn!(target: "call_queue", %uuid, error = %err, "answer feed failed");
                        let _ = answers_tx.send(CallAnswer::Error(err.to_string()));
                        done.cancel();
                        break;
                    }
                    Some(Ok(event)) => {
                        if progress.observe(&event.document, &answers_tx) {
                            done.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Ok(OfferHandle::new(
            id,
            answers_rx,
            answerer_done,
            handle_cancel,
            deadline,
        ))
    }

    async fn send_offer_update(
        &self,
        _host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), QueueError> {
        self.update(uuid, DocumentUpdate::CallerCandidate { candidate })
            .await
    }

    async fn send_offer_done(&self, _host: &str, uuid: &str) -> Result<(), QueueError> {
        self.update(uuid, DocumentUpdate::CallerDone).await
    }

    async fn send_offer_error(
        &self,
        _host: &str,
        uuid: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        self.update(
            uuid,
            DocumentUpdate::CallerError {
                error: error.to_string(),
            },
        )
        .await
    }
}

#[async_trait]
impl CallQueue for DistributedCallQueue {
    async fn recv_offer(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<OfferExchange, QueueError> {
        ensure_host(host)?;
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let ttl = self.store.ttl();
        let mut inserts = self.store.watch(host, WatchFilter::Inserts, None).await?;
        let (doc, token) = match self.store.find_unanswered(host).await? {
            Some(doc) => (doc, inserts.start_token().clone()),
            None => loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                    _ = self.closed.cancelled() => return Err(QueueError::Closed),
                    event = inserts.next() => event,
                };
                match event {
                    None => return Err(QueueError::Store("change feed ended".into())),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(event)) => {
                        let doc = &event.document;
                        if doc.is_unanswered() && !doc.is_expired(Utc::now(), ttl) {
                            break (event.document, event.token);
                        }
                    }
                }
            },
        };
        drop(inserts);

        let mut updates = self
            .store
            .watch(
                host,
                WatchFilter::Updates { id: doc.id.clone() },
                Some(token),
            )
            .await?;
        debug!(target: "call_queue", %host, uuid = %doc.id, "offer matched");

        let deadline = self.deadline_for(&doc);
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let caller_done = CancellationToken::new();
        let caller_error = Arc::new(Mutex::new(None));
        let mut progress = CallerProgress {
            candidates: 0,
            out: candidates_tx,
            done: caller_done.clone(),
            error: caller_error.clone(),
        };

        let feed_stop = CancellationToken::new();
        if !progress.observe(&doc) {
            let stop = feed_stop.clone();
            let closed = self.closed.clone();
            let uuid = doc.id.clone();
            self.tasks.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = closed.cancelled() => break,
                        _ = sleep_until(deadline) => break,
                        event = updates.next() => event,
                    };
                    match event {
                        None => break,
                        Some(Err(err)) => {
                            warn!(target: "call_queue", %uuid, error = %err, "caller feed failed");
                            break;
                        }
                        Some(Ok(event)) => {
                            if progress.observe(&event.document) {
                                break;
                            }
                        }
                    }
                }
                // the caller can no longer be heard from
                progress.done.cancel();
            });
        }

        let offer = CallOffer {
            uuid: doc.id.clone(),
            host: doc.host.clone(),
            sdp: doc.caller.sdp.clone(),
            disable_trickle: doc.caller.disable_trickle,
            deadline,
        };
        Ok(OfferExchange::new(
            offer,
            candidates_rx,
            caller_done,
            caller_error,
            Arc::new(StoreAnswerSink {
                store: self.store.clone(),
                id: doc.id,
            }),
            Some(feed_stop.drop_guard()),
        ))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::call_queue::store::MemoryDocumentStore;

    fn queue() -> (Arc<MemoryDocumentStore>, Arc<DistributedCallQueue>) {
        let store = MemoryDocumentStore::new(Duration::from_secs(5));
        let queue = DistributedCallQueue::new(store.clone());
        (store, queue)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn receiver_finds_offers_recorded_before_it_started() {
        let (store, queue) = queue();
        let doc = ExchangeDocument::new(
            "early".into(),
            "host".into(),
            "offer".into(),
            true,
            Utc::now(),
        );
        store.insert(doc).await.unwrap();

        let cancel = CancellationToken::new();
        let exchange = queue.recv_offer("host", &cancel).await.unwrap();
        assert_eq!(exchange.uuid(), "early");
        assert_eq!(exchange.sdp(), "offer");
        assert!(exchange.caller_done().is_cancelled());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancelled_caller_records_nothing() {
        let (store, queue) = queue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            queue.send_offer_init("host", "offer", true, &cancel).await,
            Err(QueueError::Cancelled)
        ));
        assert!(store.find_unanswered("host").await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn expired_documents_are_never_offered() {
        let (store, queue) = queue();
        let mut doc = ExchangeDocument::new(
            "old".into(),
            "host".into(),
            "offer".into(),
            true,
            Utc::now(),
        );
        doc.started_at = Utc::now() - chrono::Duration::seconds(30);
        store.insert(doc).await.unwrap();

        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            timer.cancel();
        });
        assert!(matches!(
            queue.recv_offer("host", &cancel).await,
            Err(QueueError::Cancelled)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn candidates_flow_both_ways_through_the_store() {
        let (_store, queue) = queue();
        let candidate = |n: u8| IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let cancel = CancellationToken::new();
        let mut handle = queue
            .send_offer_init("host", "offer", false, &cancel)
            .await
            .unwrap();
        let uuid = handle.uuid().to_string();
        queue
            .send_offer_update("host", &uuid, candidate(1))
            .await
            .unwrap();

        let mut exchange = queue.recv_offer("host", &cancel).await.unwrap();
        assert_eq!(exchange.uuid(), uuid);
        queue
            .send_offer_update("host", &uuid, candidate(2))
            .await
            .unwrap();
        queue.send_offer_done("host", &uuid).await.unwrap();

        assert_eq!(exchange.next_caller_candidate().await, Some(candidate(1)));
        assert_eq!(exchange.next_caller_candidate().await, Some(candidate(2)));
        assert_eq!(exchange.next_caller_candidate().await, None);

        exchange
            .respond(CallAnswer::Init("answer".into()))
            .await
            .unwrap();
        exchange
            .respond(CallAnswer::Candidate(candidate(7)))
            .await
            .unwrap();
        exchange.answerer_done().await.unwrap();

        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Init("answer".into()))
        );
        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Candidate(candidate(7)))
        );
        assert_eq!(handle.next_answer().await.unwrap(), None);
        assert!(matches!(
            queue.send_offer_update("host", &uuid, candidate(3)).await,
            Err(QueueError::ExchangeFinished(_))
        ));
    }
}
