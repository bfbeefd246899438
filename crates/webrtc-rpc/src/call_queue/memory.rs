use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ensure_host, AnswerSink, CallAnswer, CallOffer, CallQueue, IceCandidate, OfferExchange,
    OfferHandle, OfferSignaler, QueueError,
};
use crate::config::QueueConfig;

/// In-process call queue.
///
/// Each host owns a FIFO of offers waiting to be claimed and a FIFO of
/// receivers waiting for an offer. A send only returns once a receiver has
/// acknowledged its offer.
pub struct MemoryCallQueue {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    hosts: Mutex<HashMap<String, HostQueue>>,
    config: QueueConfig,
    uuids: UuidSource,
    tickets: AtomicU64,
    closed: CancellationToken,
}

enum UuidSource {
    Random,
    Counter(AtomicU64),
}

struct HostQueue {
    pending: VecDeque<(u64, Handoff)>,
    waiting: VecDeque<(u64, oneshot::Sender<Handoff>)>,
    active: HashMap<String, Arc<ActiveExchange>>,
    touched_at: Instant,
}

impl HostQueue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            waiting: VecDeque::new(),
            active: HashMap::new(),
            touched_at: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && self.active.is_empty()
            && self.waiting.iter().all(|(_, tx)| tx.is_closed())
    }
}

/// Record moved to a receiver. Dropping it unacknowledged makes the sender
/// place it again.
struct Handoff {
    exchange: Arc<ActiveExchange>,
    claimed: oneshot::Sender<()>,
}

struct ActiveExchange {
    offer: CallOffer,
    caller_candidates: mpsc::UnboundedSender<IceCandidate>,
    caller_candidates_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    caller_done: CancellationToken,
    caller_error: Arc<Mutex<Option<String>>>,
    answers: mpsc::UnboundedSender<CallAnswer>,
    answerer_done: CancellationToken,
    cancel: CancellationToken,
}

impl ActiveExchange {
    fn expired(&self, now: Instant) -> bool {
        self.cancel.is_cancelled() || now >= self.offer.deadline
    }

    fn finished(&self, now: Instant) -> bool {
        self.expired(now) || (self.caller_done.is_cancelled() && self.answerer_done.is_cancelled())
    }

    fn terminate(&self) {
        self.caller_done.cancel();
        self.answerer_done.cancel();
    }

    /// Releases the receiver without reporting a clean answerer finish to
    /// the caller.
    fn evict(&self) {
        self.caller_done.cancel();
    }
}

impl MemoryCallQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Self::with_uuids(config, UuidSource::Random)
    }

    /// UUIDs are assigned from a counter starting at 1.
    pub fn deterministic(config: QueueConfig) -> Arc<Self> {
        Self::with_uuids(config, UuidSource::Counter(AtomicU64::new(0)))
    }

    fn with_uuids(config: QueueConfig, uuids: UuidSource) -> Arc<Self> {
        let shared = Arc::new(Shared {
            hosts: Mutex::new(HashMap::new()),
            config,
            uuids,
            tickets: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });
        let sweeper = tokio::spawn(sweep_loop(shared.clone()));
        Arc::new(Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    fn lookup(&self, host: &str, uuid: &str) -> Result<Arc<ActiveExchange>, QueueError> {
        let hosts = self.shared.hosts.lock();
        hosts
            .get(host)
            .and_then(|queue| queue.active.get(uuid))
            .cloned()
            .ok_or_else(|| QueueError::UnknownExchange(uuid.to_string()))
    }

    #[cfg(test)]
    fn host_count(&self) -> usize {
        self.shared.hosts.lock().len()
    }
}

impl Shared {
    fn next_uuid(&self) -> String {
        match &self.uuids {
            UuidSource::Random => Uuid::new_v4().to_string(),
            UuidSource::Counter(counter) => {
                let value = counter.fetch_add(1, Ordering::Relaxed) + 1;
                Uuid::from_u128(u128::from(value)).to_string()
            }
        }
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    /// Hands the offer to the oldest live receiver, or queues it. Returns the
    /// pending ticket when queued.
    fn place(&self, exchange: &Arc<ActiveExchange>, claimed: oneshot::Sender<()>) -> Option<u64> {
        let mut hosts = self.hosts.lock();
        let queue = hosts
            .entry(exchange.offer.host.clone())
            .or_insert_with(HostQueue::new);
        queue.touched_at = Instant::now();
        queue
            .active
            .entry(exchange.offer.uuid.clone())
            .or_insert_with(|| exchange.clone());

        let mut handoff = Handoff {
            exchange: exchange.clone(),
            claimed,
        };
        while let Some((_, waiter)) = queue.waiting.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return None,
                Err(returned) => handoff = returned,
            }
        }
        let ticket = self.next_ticket();
        queue.pending.push_back((ticket, handoff));
        Some(ticket)
    }

    fn withdraw(&self, host: &str, uuid: &str, ticket: Option<u64>) {
        let mut hosts = self.hosts.lock();
        if let Some(queue) = hosts.get_mut(host) {
            if let Some(ticket) = ticket {
                queue.pending.retain(|(pending, _)| *pending != ticket);
            }
            queue.active.remove(uuid);
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let idle = self.config.host_idle;
        let mut hosts = self.hosts.lock();
        hosts.retain(|host, queue| {
            queue.active.retain(|uuid, exchange| {
                if exchange.finished(now) {
                    trace!(target: "call_queue", %host, %uuid, "evicting exchange");
                    exchange.evict();
                    false
                } else {
                    true
                }
            });
            queue.pending.retain(|(_, handoff)| !handoff.claimed.is_closed());
            queue.waiting.retain(|(_, tx)| !tx.is_closed());
            let keep = !queue.is_idle() || now.duration_since(queue.touched_at) < idle;
            if !keep {
                debug!(target: "call_queue", %host, "dropping idle host queue");
            }
            keep
        });
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = interval.tick() => shared.sweep(),
        }
    }
}

struct MemoryAnswerSink {
    exchange: Arc<ActiveExchange>,
}

#[async_trait]
impl AnswerSink for MemoryAnswerSink {
    async fn respond(&self, answer: CallAnswer) -> Result<(), QueueError> {
        let exchange = &self.exchange;
        if exchange.answerer_done.is_cancelled() || exchange.expired(Instant::now()) {
            return Err(QueueError::ExchangeFinished(exchange.offer.uuid.clone()));
        }
        let terminal = matches!(answer, CallAnswer::Error(_));
        exchange
            .answers
            .send(answer)
            .map_err(|_| QueueError::ExchangeFinished(exchange.offer.uuid.clone()))?;
        if terminal {
            exchange.answerer_done.cancel();
        }
        Ok(())
    }

    async fn done(&self) -> Result<(), QueueError> {
        self.exchange.answerer_done.cancel();
        Ok(())
    }
}

#[async_trait]
impl OfferSignaler for MemoryCallQueue {
    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        disable_trickle: bool,
        cancel: &CancellationToken,
    ) -> Result<OfferHandle, QueueError> {
        ensure_host(host)?;
        if self.shared.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let uuid = self.shared.next_uuid();
        let deadline = Instant::now() + self.shared.config.offer_deadline;
        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let handle_cancel = CancellationToken::new();
        let caller_done = handle_cancel.child_token();
        if disable_trickle {
            caller_done.cancel();
        }
        let exchange = Arc::new(ActiveExchange {
            offer: CallOffer {
                uuid: uuid.clone(),
                host: host.to_string(),
                sdp: sdp.to_string(),
                disable_trickle,
                deadline,
            },
            caller_candidates: candidates_tx,
            caller_candidates_rx: Mutex::new(Some(candidates_rx)),
            caller_done,
            caller_error: Arc::new(Mutex::new(None)),
            answers: answers_tx,
            answerer_done: CancellationToken::new(),
            cancel: handle_cancel.clone(),
        });

        loop {
            let (claimed_tx, claimed_rx) = oneshot::channel();
            let ticket = self.shared.place(&exchange, claimed_tx);
            trace!(target: "call_queue", %host, %uuid, queued = ticket.is_some(), "offer placed");

            let outcome = tokio::select! {
                claimed = claimed_rx => match claimed {
                    Ok(()) => Ok(true),
                    Err(_) => Ok(false),
                },
                _ = cancel.cancelled() => Err(QueueError::Cancelled),
                _ = self.shared.closed.cancelled() => Err(QueueError::Closed),
                _ = sleep_until(deadline) => Err(QueueError::DeadlineExceeded),
            };
            match outcome {
                Ok(true) => break,
                Ok(false) => continue,
                Err(err) => {
                    self.shared.withdraw(host, &uuid, ticket);
                    exchange.terminate();
                    handle_cancel.cancel();
                    debug!(target: "call_queue", %host, %uuid, error = %err, "offer not claimed");
                    return Err(err);
                }
            }
        }

        Ok(OfferHandle::new(
            uuid,
            answers_rx,
            exchange.answerer_done.clone(),
            handle_cancel,
            deadline,
        ))
    }

    async fn send_offer_update(
        &self,
        host: &str,
        uuid: &str,
        candidate: IceCandidate,
    ) -> Result<(), QueueError> {
        let exchange = self.lookup(host, uuid)?;
        if exchange.caller_done.is_cancelled() {
            return Err(QueueError::ExchangeFinished(uuid.to_string()));
        }
        exchange
            .caller_candidates
            .send(candidate)
            .map_err(|_| QueueError::ExchangeFinished(uuid.to_string()))
    }

    async fn send_offer_done(&self, host: &str, uuid: &str) -> Result<(), QueueError> {
        let exchange = self.lookup(host, uuid)?;
        exchange.caller_done.cancel();
        Ok(())
    }

    async fn send_offer_error(
        &self,
        host: &str,
        uuid: &str,
        error: &str,
    ) -> Result<(), QueueError> {
        let exchange = self.lookup(host, uuid)?;
        if exchange.caller_done.is_cancelled() {
            return Err(QueueError::ExchangeFinished(uuid.to_string()));
        }
        *exchange.caller_error.lock() = Some(error.to_string());
        exchange.caller_done.cancel();
        Ok(())
    }
}

#[async_trait]
impl CallQueue for MemoryCallQueue {
    async fn recv_offer(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<OfferExchange, QueueError> {
        ensure_host(host)?;
        loop {
            if self.shared.closed.is_cancelled() {
                return Err(QueueError::Closed);
            }

            enum Next {
                Ready(Handoff),
                Wait(u64, oneshot::Receiver<Handoff>),
            }

            let next = {
                let mut hosts = self.shared.hosts.lock();
                let queue = hosts
                    .entry(host.to_string())
                    .or_insert_with(HostQueue::new);
                queue.touched_at = Instant::now();
                let mut ready = None;
                while let Some((_, handoff)) = queue.pending.pop_front() {
                    if !handoff.claimed.is_closed() {
                        ready = Some(handoff);
                        break;
                    }
                }
                match ready {
                    Some(handoff) => Next::Ready(handoff),
                    None => {
                        let ticket = self.shared.next_ticket();
                        let (tx, rx) = oneshot::channel();
                        queue.waiting.push_back((ticket, tx));
                        Next::Wait(ticket, rx)
                    }
                }
            };

            let handoff = match next {
                Next::Ready(handoff) => handoff,
                Next::Wait(ticket, rx) => {
                    let received = tokio::select! {
                        handoff = rx => handoff.ok(),
                        _ = cancel.cancelled() => {
                            self.forget_waiter(host, ticket);
                            return Err(QueueError::Cancelled);
                        }
                        _ = self.shared.closed.cancelled() => return Err(QueueError::Closed),
                    };
                    match received {
                        Some(handoff) => handoff,
                        None => continue,
                    }
                }
            };

            let Handoff { exchange, claimed } = handoff;
            if claimed.send(()).is_err() {
                // sender gave up between placing and our claim
                continue;
            }
            let Some(candidates) = exchange.caller_candidates_rx.lock().take() else {
                continue;
            };
            debug!(target: "call_queue", %host, uuid = %exchange.offer.uuid, "offer claimed");
            return Ok(OfferExchange::new(
                exchange.offer.clone(),
                candidates,
                exchange.caller_done.clone(),
                exchange.caller_error.clone(),
                Arc::new(MemoryAnswerSink {
                    exchange: exchange.clone(),
                }),
                None,
            ));
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shared.closed.cancel();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let mut hosts = self.shared.hosts.lock();
        for queue in hosts.values() {
            for exchange in queue.active.values() {
                exchange.terminate();
            }
        }
        hosts.clear();
        Ok(())
    }
}

impl MemoryCallQueue {
    fn forget_waiter(&self, host: &str, ticket: u64) {
        let mut hosts = self.shared.hosts.lock();
        if let Some(queue) = hosts.get_mut(host) {
            queue.waiting.retain(|(waiting, _)| *waiting != ticket);
        }
    }
}

impl Drop for MemoryCallQueue {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            offer_deadline: Duration::from_secs(5),
            host_idle: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn deterministic_uuids_count_up() {
        let queue = MemoryCallQueue::deterministic(fast_config());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let first = queue.recv_offer("host", &cancel).await.unwrap();
                let second = queue.recv_offer("host", &cancel).await.unwrap();
                (first.uuid().to_string(), second.uuid().to_string())
            })
        };
        let cancel = CancellationToken::new();
        let first = queue.send_offer_init("host", "a", true, &cancel).await.unwrap();
        let second = queue.send_offer_init("host", "b", true, &cancel).await.unwrap();
        let (seen_first, seen_second) = receiver.await.unwrap();

        assert_eq!(first.uuid(), Uuid::from_u128(1).to_string());
        assert_eq!(second.uuid(), Uuid::from_u128(2).to_string());
        assert_eq!(seen_first, first.uuid());
        assert_eq!(seen_second, second.uuid());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offers_are_claimed_in_arrival_order() {
        let queue = MemoryCallQueue::new(fast_config());
        let mut senders = Vec::new();
        for sdp in ["one", "two", "three"] {
            let queue = queue.clone();
            senders.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.send_offer("host", sdp, &cancel).await
            }));
            // let each sender enqueue before the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let cancel = CancellationToken::new();
        for expected in ["one", "two", "three"] {
            let exchange = queue.recv_offer("host", &cancel).await.unwrap();
            assert_eq!(exchange.sdp(), expected);
            exchange
                .respond(CallAnswer::Init(format!("{expected}-answer")))
                .await
                .unwrap();
            exchange.answerer_done().await.unwrap();
        }
        for (sender, expected) in senders.into_iter().zip(["one", "two", "three"]) {
            assert_eq!(sender.await.unwrap().unwrap(), format!("{expected}-answer"));
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn trickled_candidates_reach_the_receiver_until_done() {
        let queue = MemoryCallQueue::new(fast_config());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut exchange = queue.recv_offer("host", &cancel).await.unwrap();
                assert!(!exchange.disable_trickle());
                exchange
                    .respond(CallAnswer::Init("answer".into()))
                    .await
                    .unwrap();
                exchange
                    .respond(CallAnswer::Candidate(candidate(9)))
                    .await
                    .unwrap();
                exchange.answerer_done().await.unwrap();
                let mut seen = Vec::new();
                while let Some(candidate) = exchange.next_caller_candidate().await {
                    seen.push(candidate);
                }
                seen
            })
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
        queue
            .send_offer_update("host", &uuid, candidate(2))
            .await
            .unwrap();
        queue.send_offer_done("host", &uuid).await.unwrap();
        assert_eq!(
            queue.send_offer_update("host", &uuid, candidate(3)).await,
            Err(QueueError::ExchangeFinished(uuid.clone()))
        );

        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Init("answer".into()))
        );
        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Candidate(candidate(9)))
        );
        assert_eq!(handle.next_answer().await.unwrap(), None);
        assert_eq!(receiver.await.unwrap(), vec![candidate(1), candidate(2)]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn caller_error_is_visible_to_receiver() {
        let queue = MemoryCallQueue::new(fast_config());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut exchange = queue.recv_offer("host", &cancel).await.unwrap();
                assert_eq!(exchange.next_caller_candidate().await, None);
                exchange.caller_error()
            })
        };
        let cancel = CancellationToken::new();
        let handle = queue
            .send_offer_init("host", "offer", false, &cancel)
            .await
            .unwrap();
        queue
            .send_offer_error("host", handle.uuid(), "ice failed")
            .await
            .unwrap();
        assert_eq!(receiver.await.unwrap(), Some("ice failed".to_string()));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn responses_after_error_are_rejected() {
        let queue = MemoryCallQueue::new(fast_config());
        let sender = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.send_offer("host", "offer", &cancel).await
            })
        };
        let cancel = CancellationToken::new();
        let exchange = queue.recv_offer("host", &cancel).await.unwrap();
        exchange
            .respond(CallAnswer::Error("nope".into()))
            .await
            .unwrap();
        assert!(matches!(
            exchange.respond(CallAnswer::Init("late".into())).await,
            Err(QueueError::ExchangeFinished(_))
        ));
        assert_eq!(
            sender.await.unwrap(),
            Err(QueueError::Answerer("nope".into()))
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn sweeper_drops_finished_exchanges_and_idle_hosts() {
        let queue = MemoryCallQueue::new(fast_config());
        let sender = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.send_offer("host", "offer", &cancel).await
            })
        };
        let cancel = CancellationToken::new();
        let exchange = queue.recv_offer("host", &cancel).await.unwrap();
        exchange
            .respond(CallAnswer::Init("answer".into()))
            .await
            .unwrap();
        exchange.answerer_done().await.unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), "answer");
        drop(exchange);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.host_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(15)]
    async fn silent_answerer_leaves_the_caller_at_its_deadline() {
        let queue = MemoryCallQueue::new(QueueConfig {
            offer_deadline: Duration::from_millis(50),
            host_idle: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(5),
        });
        for _ in 0..20 {
            let receiver = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    let exchange = queue.recv_offer("host", &cancel).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    assert!(exchange.caller_done().is_cancelled());
                    exchange.respond(CallAnswer::Init("too late".into())).await
                })
            };
            let cancel = CancellationToken::new();
            assert_eq!(
                queue.send_offer("host", "offer", &cancel).await,
                Err(QueueError::DeadlineExceeded)
            );
            assert!(matches!(
                receiver.await.unwrap(),
                Err(QueueError::ExchangeFinished(_))
            ));
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_fails_waiters_and_new_offers() {
        let queue = MemoryCallQueue::new(fast_config());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.recv_offer("host", &cancel).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await.unwrap();
        queue.close().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Closed));

        let cancel = CancellationToken::new();
        assert!(matches!(
            queue.send_offer_init("host", "offer", true, &cancel).await,
            Err(QueueError::Closed)
        ));
    }
}
