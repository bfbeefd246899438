use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{chunk_message, MessageAssembler};
use crate::channel::wire::{Metadata, RequestBody, ResponseBody};
use crate::channel::{ClientInner, StreamEvent};
use crate::status::Status;

/// Caller side of one call.
///
/// Cancelling the call's token or letting its deadline pass resets the
/// stream: it is forgotten locally and the server is sent `RstStream`.
/// Dropping a stream that has not seen Trailers does the same.
pub struct ClientStream {
    id: u64,
    channel: Arc<ClientInner>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    backlog: VecDeque<ResponseBody>,
    assembler: MessageAssembler,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    header: Option<Metadata>,
    trailer: Option<Metadata>,
    status: Option<Status>,
    send_closed: bool,
    finished: bool,
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

enum Wake {
    Event(Option<StreamEvent>),
    Cancelled,
    Deadline,
}

impl ClientStream {
    pub(crate) fn new(
        id: u64,
        channel: Arc<ClientInner>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            channel,
            events,
            backlog: VecDeque::new(),
            assembler: MessageAssembler::default(),
            cancel,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            header: None,
            trailer: None,
            status: None,
            send_closed: false,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.send_message(message, false).await
    }

    /// Sends `message` and half-closes the stream in the same frame.
    pub async fn send_last(&mut self, message: Bytes) -> Result<(), Status> {
        self.send_message(message, true).await
    }

    /// Half-closes the sending direction.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        if self.send_closed {
            return Ok(());
        }
        self.check_sendable()?;
        self.send_closed = true;
        self.channel
            .send_request(
                self.id,
                RequestBody::Message {
                    packet: None,
                    eos: true,
                },
            )
            .await
    }

    async fn send_message(&mut self, message: Bytes, last: bool) -> Result<(), Status> {
        if self.send_closed {
            return Err(Status::internal("send after close_send"));
        }
        if let Some(status) = self.interrupted() {
            return Err(self.abort(status).await);
        }
        self.check_sendable()?;
        if last {
            self.send_closed = true;
        }
        let packets = chunk_message(message, self.channel.base().chunk_size());
        let count = packets.len();
        for (index, packet) in packets.into_iter().enumerate() {
            let body = RequestBody::Message {
                packet: Some(packet),
                eos: last && index + 1 == count,
            };
            self.channel.send_request(self.id, body).await?;
        }
        Ok(())
    }

    fn check_sendable(&self) -> Result<(), Status> {
        match &self.status {
            Some(status) if status.is_ok() => Err(Status::internal("stream already finished")),
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    fn interrupted(&self) -> Option<Status> {
        if self.status.is_some() {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(Status::cancelled("call cancelled"));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Status::deadline_exceeded("call deadline exceeded"))
            }
            _ => None,
        }
    }

    /// Next response message; `Ok(None)` once the server finished with OK.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(status) = &self.status {
                return if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status.clone())
                };
            }
            let body = match self.backlog.pop_front() {
                Some(body) => body,
                None => self.next_body().await?,
            };
            match body {
                ResponseBody::Headers(metadata) => {
                    self.header.get_or_insert(metadata);
                }
                ResponseBody::Message(packet) => match self.assembler.push(packet) {
                    Ok(Some(message)) => return Ok(Some(message)),
                    Ok(None) => {}
                    Err(status) => return Err(self.abort(status).await),
                },
                ResponseBody::Trailers { status, metadata } => {
                    self.trailer = Some(metadata);
                    self.finish(status);
                }
            }
        }
    }

    /// Response headers. Waits for them; a Trailers-only response yields
    /// empty metadata.
    pub async fn header(&mut self) -> Result<Metadata, Status> {
        loop {
            if let Some(header) = &self.header {
                return Ok(header.clone());
            }
            if self.status.is_some()
                || self
                    .backlog
                    .iter()
                    .any(|body| matches!(body, ResponseBody::Trailers { .. }))
            {
                return Ok(Metadata::new());
            }
            let body = self.next_body().await?;
            match body {
                ResponseBody::Headers(metadata) => self.header = Some(metadata),
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Trailer metadata, once Trailers arrived.
    pub fn trailer(&self) -> Option<&Metadata> {
        self.trailer.as_ref()
    }

    /// Final status, once the stream has finished.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    async fn next_body(&mut self) -> Result<ResponseBody, Status> {
        let deadline = self.deadline;
        let wake = tokio::select! {
            event = self.events.recv() => Wake::Event(event),
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = sleep_until_opt(deadline) => Wake::Deadline,
        };
        match wake {
            Wake::Event(Some(StreamEvent::Frame(body))) => Ok(body),
            Wake::Event(Some(StreamEvent::Closed(status))) => {
                self.finish(status.clone());
                Err(status)
            }
            Wake::Event(None) => {
                let status = self.channel.base().closed_status();
                self.finish(status.clone());
                Err(status)
            }
            Wake::Cancelled => Err(self.abort(Status::cancelled("call cancelled")).await),
            Wake::Deadline => Err(self
                .abort(Status::deadline_exceeded("call deadline exceeded"))
                .await),
        }
    }

    fn finish(&mut self, status: Status) {
        self.finished = true;
        self.status.get_or_insert(status);
    }

    async fn abort(&mut self, status: Status) -> Status {
        if !self.finished {
            self.finished = true;
            self.channel.remove(self.id);
            if let Err(err) = self.channel.send_request(self.id, RequestBody::RstStream).await {
                debug!(target: "channel", stream_id = self.id, error = %err, "could not reset stream");
            }
        }
        self.status.get_or_insert(status).clone()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.channel.remove(self.id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.channel.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(err) = channel.send_request(id, RequestBody::RstStream).await {
                debug!(target: "channel", stream_id = id, error = %err, "could not reset dropped stream");
            }
        });
    }
}
