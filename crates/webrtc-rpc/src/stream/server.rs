use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{chunk_message, MessageAssembler};
use crate::channel::BaseChannel;
use crate::channel::wire::{encode_response, Metadata, PacketMessage, Response, ResponseBody};
use crate::status::Status;

/// What a handler knows about the call it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub stream_id: u64,
    pub method: String,
    pub metadata: Metadata,
    /// Derived from the timeout the caller put in Headers.
    pub deadline: Option<Instant>,
    /// Cancelled when the caller resets the stream, the deadline passes or
    /// the channel closes.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

pub(crate) struct StreamInput {
    pub(crate) packet: Option<PacketMessage>,
    pub(crate) eos: bool,
}

/// Inbound half of a server stream.
pub struct RequestStream {
    input: mpsc::UnboundedReceiver<StreamInput>,
    assembler: MessageAssembler,
    eos: bool,
}

impl RequestStream {
    pub(crate) fn new(input: mpsc::UnboundedReceiver<StreamInput>) -> Self {
        Self {
            input,
            assembler: MessageAssembler::default(),
            eos: false,
        }
    }

    /// Next request message; `Ok(None)` once the caller half-closed.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if self.eos {
                return Ok(None);
            }
            let Some(input) = self.input.recv().await else {
                return Err(Status::cancelled("stream closed"));
            };
            self.eos = input.eos;
            match input.packet {
                Some(packet) => {
                    if let Some(message) = self.assembler.push(packet)? {
                        return Ok(Some(message));
                    }
                    if input.eos {
                        return Err(Status::invalid_argument(
                            "stream ended in the middle of a message",
                        ));
                    }
                }
                None if self.assembler.is_partial() => {
                    return Err(Status::invalid_argument(
                        "stream ended in the middle of a message",
                    ));
                }
                None => {}
            }
        }
    }

    /// Reads exactly one message followed by the end of the stream.
    pub(crate) async fn recv_single(&mut self) -> Result<Bytes, Status> {
        let message = self
            .recv()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing request message"))?;
        match self.recv().await? {
            None => Ok(message),
            Some(_) => Err(Status::invalid_argument(
                "more than one request message for a single-request method",
            )),
        }
    }
}

/// Outbound half of a server stream. Clones share the same stream.
#[derive(Clone)]
pub struct ResponseSink {
    id: u64,
    base: Arc<BaseChannel>,
    header_sent: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    write: Arc<AsyncMutex<()>>,
}

impl ResponseSink {
    pub(crate) fn new(id: u64, base: Arc<BaseChannel>, finished: Arc<AtomicBool>) -> Self {
        Self {
            id,
            base,
            header_sent: Arc::new(AtomicBool::new(false)),
            finished,
            write: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Sends response headers. Only allowed before the first message.
    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        if self.header_sent.swap(true, Ordering::AcqRel) {
            return Err(Status::internal("response headers already sent"));
        }
        let _write = self.write.lock().await;
        self.ensure_open()?;
        self.write(ResponseBody::Headers(metadata)).await
    }

    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        let _write = self.write.lock().await;
        self.ensure_open()?;
        if !self.header_sent.swap(true, Ordering::AcqRel) {
            self.write(ResponseBody::Headers(Metadata::new())).await?;
        }
        for packet in chunk_message(message, self.base.chunk_size()) {
            self.write(ResponseBody::Message(packet)).await?;
        }
        Ok(())
    }

    /// Sends Trailers unless the stream already finished. Returns whether
    /// this call was the one that finished it.
    pub(crate) async fn finish(&self, status: Status, metadata: Metadata) -> bool {
        let _write = self.write.lock().await;
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self
            .write(ResponseBody::Trailers { status, metadata })
            .await;
        true
    }

    fn ensure_open(&self) -> Result<(), Status> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Status::cancelled("stream already finished"));
        }
        Ok(())
    }

    async fn write(&self, body: ResponseBody) -> Result<(), Status> {
        let frame = encode_response(&Response {
            stream: self.id,
            body,
        });
        self.base.write_frame(frame).await
    }
}

/// Both halves of a bidirectional stream, as handed to streaming handlers.
pub struct ServerStream {
    requests: RequestStream,
    responses: ResponseSink,
}

impl ServerStream {
    pub(crate) fn new(requests: RequestStream, responses: ResponseSink) -> Self {
        Self {
            requests,
            responses,
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        self.requests.recv().await
    }

    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        self.responses.send(message).await
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.responses.send_header(metadata).await
    }

    pub fn into_split(self) -> (RequestStream, ResponseSink) {
        (self.requests, self.responses)
    }
}
