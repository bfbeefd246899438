//! Real peer connections over loopback. Set `WEBRTC_RPC_SKIP_E2E=1` on
//! runners without usable network interfaces.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use webrtc_rpc::call_queue::MemoryCallQueue;
use webrtc_rpc::signaling::{router, LocalAnswerConnector, SignalingAnswerer, SignalingServer};
use webrtc_rpc::{
    dial, dial_with, CallOptions, DialOptions, PeerOptions, QueueConfig, RpcServer, ServiceRegistry,
    SignalingEndpoint,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn skip_e2e() -> bool {
    let skip = std::env::var_os("WEBRTC_RPC_SKIP_E2E").is_some_and(|value| value != "0");
    if skip {
        eprintln!("WEBRTC_RPC_SKIP_E2E is set; skipping");
    }
    skip
}

fn echo_server() -> Arc<RpcServer> {
    let mut registry = ServiceRegistry::new();
    registry.register_unary("/echo.Echo/Say", |_ctx, request| async move { Ok(request) });
    RpcServer::new(registry, PeerOptions::localhost())
}

#[test_timeout::tokio_timeout_test(60, multi_thread)]
async fn trickled_dial_through_an_in_process_queue() {
    if skip_e2e() {
        return;
    }
    init_tracing();
    let queue = MemoryCallQueue::new(QueueConfig::default());
    let signaling = SignalingServer::new(queue.clone());
    let server = echo_server();
    let answerer = SignalingAnswerer::new(
        "yeehaw",
        Arc::new(LocalAnswerConnector::new(signaling.clone())),
        server.clone(),
    );
    answerer.start();

    let cancel = CancellationToken::new();
    let channel = dial_with(queue.as_ref(), "yeehaw", &PeerOptions::localhost(), &cancel)
        .await
        .unwrap();

    let reply = channel
        .invoke("/echo.Echo/Say", Bytes::from_static(b"hello"), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hello");

    let large: Bytes = (0..1usize << 18).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let reply = channel
        .invoke("/echo.Echo/Say", large.clone(), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, large);
    assert_eq!(server.peer_count(), 1);

    channel.close();
    channel.closed().await;
    answerer.stop().await;
    server.stop().await;
    assert_eq!(server.peer_count(), 0);
}

#[test_timeout::tokio_timeout_test(60, multi_thread)]
async fn dial_over_http_signaling() {
    if skip_e2e() {
        return;
    }
    init_tracing();
    let signaling = SignalingServer::new(MemoryCallQueue::new(QueueConfig::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(signaling.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let server = echo_server();
    let answerer = SignalingAnswerer::new(
        "yeehaw",
        Arc::new(LocalAnswerConnector::new(signaling.clone())),
        server.clone(),
    );
    answerer.start();

    let options = DialOptions::new("yeehaw", SignalingEndpoint::new(addr.to_string(), true))
        .with_peer_options(PeerOptions::localhost())
        .with_timeout(Duration::from_secs(30));
    let channel = dial(options).await.unwrap();
    let reply = channel
        .invoke("/echo.Echo/Say", Bytes::from_static(b"hello"), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hello");

    answerer.stop().await;
    server.stop().await;
    signaling.shutdown().await;
}
