use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::base::{BaseChannel, FrameHandler};
use super::wire::{decode_request, Metadata, RequestBody, RequestHeaders};
use super::MAX_CONCURRENT_STREAMS;
use crate::peer::PeerTransport;
use crate::service::ServiceRegistry;
use crate::status::Status;
use crate::stream::{RequestContext, RequestStream, ResponseSink, StreamInput};

struct StreamEntry {
    input: mpsc::UnboundedSender<StreamInput>,
    cancel: CancellationToken,
    sink: ResponseSink,
}

#[derive(Default)]
struct ServerStreams {
    active: HashMap<u64, StreamEntry>,
    highest_id: u64,
}

enum Admission {
    Start(mpsc::UnboundedReceiver<StreamInput>, CancellationToken, ResponseSink),
    Duplicate(StreamEntry),
    Stale,
    Exhausted,
    Closed,
}

struct ServerInner {
    base: Arc<BaseChannel>,
    registry: Arc<ServiceRegistry>,
    streams: Mutex<ServerStreams>,
    tasks: TaskTracker,
    root: CancellationToken,
}

impl ServerInner {
    fn admit(&self, id: u64) -> Admission {
        if self.root.is_cancelled() {
            return Admission::Closed;
        }
        let mut streams = self.streams.lock();
        if let Some(entry) = streams.active.remove(&id) {
            return Admission::Duplicate(entry);
        }
        if id <= streams.highest_id {
            return Admission::Stale;
        }
        streams.highest_id = id;
        if streams.active.len() >= MAX_CONCURRENT_STREAMS {
            return Admission::Exhausted;
        }
        let (input, rx) = mpsc::unbounded_channel();
        let cancel = self.root.child_token();
        let sink = ResponseSink::new(id, self.base.clone(), Arc::new(AtomicBool::new(false)));
        streams.active.insert(
            id,
            StreamEntry {
                input,
                cancel: cancel.clone(),
                sink: sink.clone(),
            },
        );
        Admission::Start(rx, cancel, sink)
    }

    fn on_headers(self: &Arc<Self>, id: u64, headers: RequestHeaders) {
        match self.admit(id) {
            Admission::Start(input, cancel, sink) => {
                let inner = Arc::clone(self);
                self.tasks.spawn(async move {
                    inner.run_stream(id, headers, input, cancel, sink).await;
                });
            }
            Admission::Duplicate(entry) => {
                warn!(target: "channel", stream_id = id, "headers received twice");
                entry.cancel.cancel();
                self.tasks.spawn(async move {
                    entry
                        .sink
                        .finish(
                            Status::invalid_argument(format!(
                                "stream {id} already received headers"
                            )),
                            Metadata::new(),
                        )
                        .await;
                });
            }
            Admission::Stale => {
                debug!(target: "channel", stream_id = id, "headers for a retired stream id");
            }
            Admission::Exhausted => {
                warn!(target: "channel", stream_id = id, limit = MAX_CONCURRENT_STREAMS, "stream limit reached");
                let sink =
                    ResponseSink::new(id, self.base.clone(), Arc::new(AtomicBool::new(false)));
                self.tasks.spawn(async move {
                    sink.finish(
                        Status::resource_exhausted(format!(
                            "channel already carries {MAX_CONCURRENT_STREAMS} streams"
                        )),
                        Metadata::new(),
                    )
                    .await;
                });
            }
            Admission::Closed => {}
        }
    }

    async fn run_stream(
        &self,
        id: u64,
        headers: RequestHeaders,
        input: mpsc::UnboundedReceiver<StreamInput>,
        cancel: CancellationToken,
        sink: ResponseSink,
    ) {
        let deadline = headers.timeout.map(|timeout| Instant::now() + timeout);
        let ctx = RequestContext {
            stream_id: id,
            method: headers.method,
            metadata: headers.metadata,
            deadline,
            cancel: cancel.clone(),
        };
        debug!(target: "channel", stream_id = id, method = %ctx.method, "stream started");

        let outcome = match self.registry.lookup(&ctx.method).cloned() {
            None => Some(Err(Status::unimplemented(format!(
                "unknown method {}",
                ctx.method
            )))),
            Some(handler) => {
                let requests = RequestStream::new(input);
                let call = AssertUnwindSafe(handler.call(ctx, requests, sink.clone()));
                tokio::select! {
                    result = call.catch_unwind() => Some(result.unwrap_or_else(|_| {
                        Err(Status::internal("handler panicked"))
                    })),
                    _ = cancel.cancelled() => None,
                    _ = sleep_until_opt(deadline) => {
                        Some(Err(Status::deadline_exceeded("deadline exceeded")))
                    }
                }
            }
        };
        cancel.cancel();

        // a cancelled stream was reset by the caller or already answered
        if let Some(result) = outcome {
            let status = match result {
                Ok(()) => Status::ok(),
                Err(status) => status,
            };
            if !status.is_ok() {
                debug!(target: "channel", stream_id = id, code = %status.code(), message = %status.message(), "stream failed");
            }
            sink.finish(status, Metadata::new()).await;
        }
        self.streams.lock().active.remove(&id);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl FrameHandler for Arc<ServerInner> {
    async fn on_frame(&self, frame: Bytes) {
        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "channel", error = %err, "dropping undecodable request frame");
                return;
            }
        };
        let id = request.stream;
        match request.body {
            RequestBody::Headers(headers) => self.on_headers(id, headers),
            RequestBody::Message { packet, eos } => {
                let delivered = self
                    .streams
                    .lock()
                    .active
                    .get(&id)
                    .map(|entry| entry.input.send(StreamInput { packet, eos }).is_ok());
                if delivered.is_none() {
                    debug!(target: "channel", stream_id = id, "message for a stream without headers");
                }
            }
            RequestBody::RstStream => {
                let entry = self.streams.lock().active.remove(&id);
                if let Some(entry) = entry {
                    debug!(target: "channel", stream_id = id, "stream reset by caller");
                    entry.cancel.cancel();
                }
            }
        }
    }

    async fn on_channel_closed(&self, _reason: &Status) {
        self.root.cancel();
        self.streams.lock().active.clear();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Host side of a multiplexed channel: runs registered handlers for the
/// streams the remote opens.
pub struct ServerChannel {
    inner: Arc<ServerInner>,
}

impl ServerChannel {
    pub fn new(transport: Arc<dyn PeerTransport>, registry: Arc<ServiceRegistry>) -> Self {
        let base = BaseChannel::new(transport);
        let inner = Arc::new(ServerInner {
            base: base.clone(),
            registry,
            streams: Mutex::new(ServerStreams::default()),
            tasks: TaskTracker::new(),
            root: CancellationToken::new(),
        });
        base.start(Arc::new(inner.clone()));
        Self { inner }
    }

    pub fn base(&self) -> &Arc<BaseChannel> {
        &self.inner.base
    }

    pub async fn ready(&self) -> Result<(), Status> {
        self.inner.base.ready().await
    }

    /// See [`BaseChannel::on_peer_done`].
    pub fn on_peer_done(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.base.on_peer_done(callback);
    }

    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().active.len()
    }

    pub fn close(&self) {
        self.inner.base.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.base.is_closed()
    }

    /// Resolves once the channel is torn down and every stream task ended.
    pub async fn closed(&self) {
        self.inner.base.done().await;
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.inner.base.close();
    }
}
