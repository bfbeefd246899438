use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::base::{BaseChannel, FrameHandler};
use super::wire::{
    decode_response, encode_request, Metadata, Request, RequestBody, RequestHeaders, ResponseBody,
};
use super::MAX_CONCURRENT_STREAMS;
use crate::peer::PeerTransport;
use crate::status::Status;
use crate::stream::ClientStream;

/// Per-call knobs for [`ClientChannel::invoke`] and [`ClientChannel::new_stream`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    /// Sent to the server in Headers and enforced locally.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) enum StreamEvent {
    Frame(ResponseBody),
    Closed(Status),
}

struct ClientStreams {
    next_id: u64,
    active: HashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
}

pub(crate) struct ClientInner {
    base: Arc<BaseChannel>,
    streams: Mutex<ClientStreams>,
}

impl ClientInner {
    pub(crate) fn base(&self) -> &Arc<BaseChannel> {
        &self.base
    }

    fn open(&self) -> Result<(u64, mpsc::UnboundedReceiver<StreamEvent>), Status> {
        if self.base.is_closed() {
            return Err(self.base.closed_status());
        }
        let mut streams = self.streams.lock();
        if streams.active.len() >= MAX_CONCURRENT_STREAMS {
            return Err(Status::resource_exhausted(format!(
                "channel already carries {MAX_CONCURRENT_STREAMS} streams"
            )));
        }
        let id = streams.next_id;
        streams.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        streams.active.insert(id, tx);
        Ok((id, rx))
    }

    /// Forgets the stream locally; later frames for it are dropped.
    pub(crate) fn remove(&self, id: u64) {
        self.streams.lock().active.remove(&id);
    }

    pub(crate) async fn send_request(&self, id: u64, body: RequestBody) -> Result<(), Status> {
        self.base
            .write_frame(encode_request(&Request { stream: id, body }))
            .await
    }
}

#[async_trait]
impl FrameHandler for ClientInner {
    async fn on_frame(&self, frame: Bytes) {
        let response = match decode_response(&frame) {
            Ok(response) => response,
            Err(err) => {
                warn!(target: "channel", error = %err, "dropping undecodable response frame");
                return;
            }
        };
        let id = response.stream;
        let finished = matches!(response.body, ResponseBody::Trailers { .. });
        let sender = {
            let mut streams = self.streams.lock();
            if finished {
                streams.active.remove(&id)
            } else {
                streams.active.get(&id).cloned()
            }
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(StreamEvent::Frame(response.body));
            }
            None => debug!(target: "channel", stream_id = id, "response for unknown stream"),
        }
    }

    async fn on_channel_closed(&self, reason: &Status) {
        let streams: Vec<_> = self.streams.lock().active.drain().collect();
        for (_, sender) in streams {
            let _ = sender.send(StreamEvent::Closed(reason.clone()));
        }
    }
}

/// Caller side of a multiplexed channel.
///
/// Dropping the channel closes it and the transport beneath.
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

impl ClientChannel {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        let base = BaseChannel::new(transport);
        let inner = Arc::new(ClientInner {
            base: base.clone(),
            streams: Mutex::new(ClientStreams {
                next_id: 1,
                active: HashMap::new(),
            }),
        });
        base.start(inner.clone());
        Self { inner }
    }

    pub fn base(&self) -> &Arc<BaseChannel> {
        &self.inner.base
    }

    /// Waits until the data channel is open.
    pub async fn ready(&self) -> Result<(), Status> {
        self.inner.base.ready().await
    }

    /// Opens a stream and sends its Headers.
    pub async fn new_stream(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStream, Status> {
        let (id, events) = self.inner.open()?;
        let headers = RequestBody::Headers(RequestHeaders {
            method: method.to_string(),
            metadata: options.metadata,
            timeout: options.timeout,
        });
        if let Err(status) = self.inner.send_request(id, headers).await {
            self.inner.remove(id);
            return Err(status);
        }
        let cancel = options
            .cancel
            .map(|cancel| cancel.child_token())
            .unwrap_or_default();
        Ok(ClientStream::new(
            id,
            self.inner.clone(),
            events,
            cancel,
            options.timeout,
        ))
    }

    /// Unary call: one request message, exactly one response message.
    pub async fn invoke(
        &self,
        method: &str,
        request: Bytes,
        options: CallOptions,
    ) -> Result<Bytes, Status> {
        let mut stream = self.new_stream(method, options).await?;
        stream.send_last(request).await?;
        let response = stream
            .recv()
            .await?
            .ok_or_else(|| Status::internal("server sent no response message"))?;
        match stream.recv().await? {
            None => Ok(response),
            Some(_) => Err(Status::internal(
                "server sent more than one response message to a unary call",
            )),
        }
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

    /// Resolves after the channel has been torn down.
    pub async fn closed(&self) {
        self.inner.base.done().await;
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.inner.base.close();
    }
}
