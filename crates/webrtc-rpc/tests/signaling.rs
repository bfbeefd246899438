use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use webrtc_rpc::QueueConfig;
use webrtc_rpc::call_queue::{IceCandidate, MemoryCallQueue, OfferSignaler, QueueError};
use webrtc_rpc::config::SignalingEndpoint;
use webrtc_rpc::signaling::{
    router, AnswerClientStream, AnswerConnector, AnswerRequest, AnswerResponse, CallRequest,
    LocalAnswerConnector, OfferAcceptor, SignalingAnswerer, SignalingClient, SignalingError,
    SignalingServer, WebSocketConnector, CALL_PATH,
};
use webrtc_rpc::status::{Code, Status};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn signaling_server() -> Arc<SignalingServer> {
    SignalingServer::new(MemoryCallQueue::new(QueueConfig::default()))
}

/// Answers "hello" with "world" and refuses everything else.
struct GreetingAcceptor;

#[async_trait]
impl OfferAcceptor for GreetingAcceptor {
    async fn accept_offer(
        &self,
        _uuid: &str,
        sdp: &str,
        _candidates: mpsc::UnboundedReceiver<IceCandidate>,
        _cancel: &CancellationToken,
    ) -> Result<String, Status> {
        match sdp {
            "hello" => Ok("world".into()),
            _ => Err(Status::unknown("whoops")),
        }
    }
}

fn call(sdp: &str) -> CallRequest {
    CallRequest {
        sdp: sdp.to_string(),
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn call_reaches_the_answerer_for_its_host() {
    init_tracing();
    let server = signaling_server();
    let answerer = SignalingAnswerer::new(
        "yeehaw",
        Arc::new(LocalAnswerConnector::new(server.clone())),
        Arc::new(GreetingAcceptor),
    );
    answerer.start();

    let cancel = CancellationToken::new();
    let response = server
        .call(Some("yeehaw"), call("hello"), &cancel)
        .await
        .unwrap();
    assert_eq!(response.sdp, "world");

    let err = server
        .call(Some("yeehaw"), call("goodbye"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert!(err.message().contains("whoops"), "{err}");

    answerer.stop().await;
    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn missing_host_is_invalid_argument() {
    let server = signaling_server();
    let cancel = CancellationToken::new();

    let err = server.call(None, call("hello"), &cancel).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = server
        .call(Some(""), call("hello"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let connector = LocalAnswerConnector::new(server.clone());
    assert!(matches!(
        connector.connect("").await,
        Err(SignalingError::MissingHost)
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn broken_answer_stream_fails_the_pending_call() {
    let server = signaling_server();
    let connector = LocalAnswerConnector::new(server.clone());
    let mut stream = connector.connect("yeehaw").await.unwrap();

    let caller = {
        let server = server.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            server.call(Some("yeehaw"), call("hello"), &cancel).await
        })
    };

    match stream.recv().await.unwrap() {
        Some(AnswerRequest::Init { sdp, disable_trickle, .. }) => {
            assert_eq!(sdp, "hello");
            assert!(disable_trickle);
        }
        other => panic!("unexpected {other:?}"),
    }
    drop(stream);

    let err = caller.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert!(err.message().contains("answerer disconnected"), "{err}");
}

#[test_timeout::tokio_timeout_test(10)]
async fn replies_to_other_offers_are_ignored() {
    let server = signaling_server();
    let connector = LocalAnswerConnector::new(server.clone());
    let mut stream = connector.connect("yeehaw").await.unwrap();

    let caller = {
        let server = server.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            server.call(Some("yeehaw"), call("hello"), &cancel).await
        })
    };

    let uuid = match stream.recv().await.unwrap() {
        Some(request) => request.uuid().to_string(),
        None => panic!("answer stream closed"),
    };
    stream
        .send(AnswerResponse::Init {
            uuid: "someone-else".into(),
            sdp: "wrong".into(),
        })
        .await
        .unwrap();
    stream
        .send(AnswerResponse::Init {
            uuid,
            sdp: "world".into(),
        })
        .await
        .unwrap();

    assert_eq!(caller.await.unwrap().unwrap().sdp, "world");
}

/// Hands out one stream that is already dead, then real ones.
struct FlakyConnector {
    inner: LocalAnswerConnector,
    attempts: Arc<AtomicUsize>,
}

struct DeadStream;

#[async_trait]
impl AnswerClientStream for DeadStream {
    async fn send(&mut self, _response: AnswerResponse) -> Result<(), SignalingError> {
        Err(SignalingError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Option<AnswerRequest>, SignalingError> {
        Ok(None)
    }
}

#[async_trait]
impl AnswerConnector for FlakyConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn AnswerClientStream>, SignalingError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Box::new(DeadStream));
        }
        self.inner.connect(host).await
    }
}

#[test_timeout::tokio_timeout_test(15)]
async fn answerer_redials_after_its_stream_drops() {
    init_tracing();
    let server = signaling_server();
    let attempts = Arc::new(AtomicUsize::new(0));
    let answerer = SignalingAnswerer::new(
        "yeehaw",
        Arc::new(FlakyConnector {
            inner: LocalAnswerConnector::new(server.clone()),
            attempts: attempts.clone(),
        }),
        Arc::new(GreetingAcceptor),
    );
    answerer.start();

    let cancel = CancellationToken::new();
    let response = server
        .call(Some("yeehaw"), call("hello"), &cancel)
        .await
        .unwrap();
    assert_eq!(response.sdp, "world");
    assert!(attempts.load(Ordering::SeqCst) >= 2);

    answerer.stop().await;
}

#[test_timeout::tokio_timeout_test(15, multi_thread)]
async fn http_and_websocket_surface_round_trip() {
    init_tracing();
    let server = signaling_server();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(server.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let endpoint = SignalingEndpoint::new(addr.to_string(), true);
    let answerer = SignalingAnswerer::new(
        "yeehaw",
        Arc::new(WebSocketConnector::new(endpoint.clone()).unwrap()),
        Arc::new(GreetingAcceptor),
    );
    answerer.start();

    let client = SignalingClient::new(endpoint.clone()).unwrap();
    assert_eq!(client.call("yeehaw", "hello").await.unwrap(), "world");

    match client.call("yeehaw", "goodbye").await {
        Err(SignalingError::Status(status)) => {
            assert_eq!(status.code(), Code::Unknown);
            assert!(status.message().contains("whoops"), "{status}");
        }
        other => panic!("unexpected {other:?}"),
    }

    let cancel = CancellationToken::new();
    assert_eq!(
        client.send_offer("yeehaw", "hello", &cancel).await.unwrap(),
        "world"
    );
    assert!(matches!(
        client.send_offer("yeehaw", "goodbye", &cancel).await,
        Err(QueueError::Answerer(message)) if message.contains("whoops")
    ));

    let response = reqwest::Client::new()
        .post(endpoint.http_url(CALL_PATH))
        .json(&call("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let status: Status = response.json().await.unwrap();
    assert_eq!(status.code(), Code::InvalidArgument);

    answerer.stop().await;
    server.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn http_client_refuses_trickle_and_reports_unreachable_servers() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = SignalingClient::new(SignalingEndpoint::new(addr.to_string(), true)).unwrap();
    assert!(!client.supports_trickle());
    assert!(matches!(
        client.send_offer_update("yeehaw", "some-uuid", candidate()).await,
        Err(QueueError::Unsupported(_))
    ));
    assert!(matches!(
        client.send_offer_done("yeehaw", "some-uuid").await,
        Err(QueueError::Unsupported(_))
    ));
    assert!(matches!(
        client.send_offer_error("yeehaw", "some-uuid", "ice failed").await,
        Err(QueueError::Unsupported(_))
    ));

    let cancel = CancellationToken::new();
    let err = client
        .send_offer("yeehaw", "hello", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Unavailable(_)), "{err:?}");
    assert_eq!(Status::from(err).code(), Code::Unavailable);
}

fn candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 udp 2130706431 127.0.0.1 40001 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
