use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc_rpc::QueueConfig;
use webrtc_rpc::call_queue::{
    CallAnswer, CallQueue, DistributedCallQueue, IceCandidate, MemoryCallQueue,
    MemoryDocumentStore, OfferSignaler, QueueError,
};

const DEADLINE: Duration = Duration::from_secs(1);

fn backends() -> Vec<(&'static str, Arc<dyn CallQueue>)> {
    let memory: Arc<dyn CallQueue> = MemoryCallQueue::new(QueueConfig {
        offer_deadline: DEADLINE,
        host_idle: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(20),
    });
    let distributed: Arc<dyn CallQueue> =
        DistributedCallQueue::new(MemoryDocumentStore::new(DEADLINE));
    vec![("memory", memory), ("distributed", distributed)]
}

fn candidate(n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 192.168.1.{n} 4000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        timer.cancel();
    });
    cancel
}

/// Claims one offer for `host`, checks its SDP and replies with `answer`.
fn answer_once(
    queue: Arc<dyn CallQueue>,
    host: &'static str,
    expected_sdp: &'static str,
    answer: CallAnswer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let exchange = queue.recv_offer(host, &cancel).await.unwrap();
        assert_eq!(exchange.sdp(), expected_sdp);
        assert_eq!(exchange.host(), host);
        let failed = matches!(answer, CallAnswer::Error(_));
        exchange.respond(answer).await.unwrap();
        if !failed {
            exchange.answerer_done().await.unwrap();
        }
    })
}

#[test_timeout::tokio_timeout_test(10)]
async fn receiving_for_a_silent_host_ends_with_the_token() {
    for (name, queue) in backends() {
        let cancel = cancel_after(Duration::from_millis(100));
        let result = queue.recv_offer("ghost", &cancel).await;
        assert!(
            matches!(result, Err(QueueError::Cancelled)),
            "{name}: unexpected {result:?}",
            result = result.map(|exchange| exchange.uuid().to_string())
        );
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_is_answered_by_the_waiting_host() {
    for (name, queue) in backends() {
        let answerer = answer_once(
            queue.clone(),
            "yeehaw",
            "hello",
            CallAnswer::Init("world".into()),
        );
        let cancel = CancellationToken::new();
        let sdp = queue.send_offer("yeehaw", "hello", &cancel).await.unwrap();
        assert_eq!(sdp, "world", "{name}");
        answerer.await.unwrap();
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn answerer_error_reaches_the_caller_verbatim() {
    for (name, queue) in backends() {
        let answerer = answer_once(
            queue.clone(),
            "yeehaw",
            "hello",
            CallAnswer::Error("whoops".into()),
        );
        let cancel = CancellationToken::new();
        let err = queue
            .send_offer("yeehaw", "hello", &cancel)
            .await
            .unwrap_err();
        match err {
            QueueError::Answerer(message) => assert!(message.contains("whoops"), "{name}"),
            other => panic!("{name}: unexpected {other:?}"),
        }
        answerer.await.unwrap();
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn empty_host_is_refused() {
    for (name, queue) in backends() {
        let cancel = CancellationToken::new();
        let err = queue.send_offer("", "hello", &cancel).await.unwrap_err();
        assert_eq!(err, QueueError::EmptyHost, "{name}");
    }
}

#[test_timeout::tokio_timeout_test(15, multi_thread)]
async fn unmatched_callers_and_receivers_time_out_and_leave_the_queue_usable() {
    for (name, queue) in backends() {
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let sender = queue.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let err = sender
                    .send_offer("nobody-answers", "hello", &cancel)
                    .await
                    .unwrap_err();
                assert_eq!(err, QueueError::DeadlineExceeded);
            }));
            let receiver = queue.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = cancel_after(Duration::from_millis(300));
                let result = receiver.recv_offer("nobody-calls", &cancel).await;
                assert!(matches!(result, Err(QueueError::Cancelled)));
            }));
        }
        for task in tasks {
            task.await.unwrap_or_else(|err| panic!("{name}: {err}"));
        }

        // cancelled receivers must not linger and swallow the next offer
        let answerer = answer_once(
            queue.clone(),
            "nobody-calls",
            "again",
            CallAnswer::Init("finally".into()),
        );
        let cancel = CancellationToken::new();
        let sdp = queue
            .send_offer("nobody-calls", "again", &cancel)
            .await
            .unwrap();
        assert_eq!(sdp, "finally", "{name}");
        answerer.await.unwrap();
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn trickled_candidates_flow_both_ways_and_stop_after_done() {
    for (name, queue) in backends() {
        let (exchange_tx, exchange_rx) = tokio::sync::oneshot::channel();
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let exchange = queue.recv_offer("yeehaw", &cancel).await.unwrap();
                let _ = exchange_tx.send(exchange);
            })
        };

        let cancel = CancellationToken::new();
        let mut handle = queue
            .send_offer_init("yeehaw", "offer", false, &cancel)
            .await
            .unwrap();
        let uuid = handle.uuid().to_string();
        let mut exchange = exchange_rx.await.unwrap();
        receiver.await.unwrap();
        assert_eq!(exchange.uuid(), uuid, "{name}");
        assert!(!exchange.disable_trickle());

        queue
            .send_offer_update("yeehaw", &uuid, candidate(1))
            .await
            .unwrap();
        queue.send_offer_done("yeehaw", &uuid).await.unwrap();
        assert!(
            queue
                .send_offer_update("yeehaw", &uuid, candidate(2))
                .await
                .is_err(),
            "{name}: update after done must be rejected"
        );
        assert_eq!(exchange.next_caller_candidate().await, Some(candidate(1)));
        assert_eq!(exchange.next_caller_candidate().await, None);

        exchange
            .respond(CallAnswer::Init("answer".into()))
            .await
            .unwrap();
        exchange
            .respond(CallAnswer::Candidate(candidate(9)))
            .await
            .unwrap();
        exchange.answerer_done().await.unwrap();
        assert!(
            exchange
                .respond(CallAnswer::Candidate(candidate(10)))
                .await
                .is_err(),
            "{name}: response after done must be rejected"
        );

        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Init("answer".into()))
        );
        assert_eq!(
            handle.next_answer().await.unwrap(),
            Some(CallAnswer::Candidate(candidate(9)))
        );
        assert_eq!(handle.next_answer().await.unwrap(), None, "{name}");
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn closed_queue_refuses_offers() {
    for (name, queue) in backends() {
        queue.close().await.unwrap();
        let cancel = CancellationToken::new();
        let err = queue
            .send_offer("yeehaw", "hello", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Closed, "{name}");
    }
}
