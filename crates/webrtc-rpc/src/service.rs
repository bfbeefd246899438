//! Method table consulted by the server channel for every new stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::status::Status;
use crate::stream::{RequestContext, RequestStream, ResponseSink, ServerStream};

type UnaryFn = dyn Fn(RequestContext, Bytes) -> BoxFuture<'static, Result<Bytes, Status>>
    + Send
    + Sync;
type ServerStreamingFn = dyn Fn(RequestContext, Bytes, ResponseSink) -> BoxFuture<'static, Result<(), Status>>
    + Send
    + Sync;
type ClientStreamingFn = dyn Fn(RequestContext, RequestStream) -> BoxFuture<'static, Result<Bytes, Status>>
    + Send
    + Sync;
type BidiStreamingFn = dyn Fn(RequestContext, ServerStream) -> BoxFuture<'static, Result<(), Status>>
    + Send
    + Sync;

/// How a method consumes requests and produces responses.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(Arc<UnaryFn>),
    ServerStreaming(Arc<ServerStreamingFn>),
    ClientStreaming(Arc<ClientStreamingFn>),
    BidiStreaming(Arc<BidiStreamingFn>),
}

impl MethodHandler {
    pub fn kind(&self) -> &'static str {
        match self {
            MethodHandler::Unary(_) => "unary",
            MethodHandler::ServerStreaming(_) => "server_streaming",
            MethodHandler::ClientStreaming(_) => "client_streaming",
            MethodHandler::BidiStreaming(_) => "bidi_streaming",
        }
    }

    /// Runs the method to completion. `Ok(())` means the handler finished
    /// cleanly and the stream ends with an OK status.
    pub(crate) async fn call(
        &self,
        ctx: RequestContext,
        mut requests: RequestStream,
        responses: ResponseSink,
    ) -> Result<(), Status> {
        match self {
            MethodHandler::Unary(handler) => {
                let request = requests.recv_single().await?;
                let response = handler(ctx, request).await?;
                responses.send(response).await
            }
            MethodHandler::ServerStreaming(handler) => {
                let request = requests.recv_single().await?;
                handler(ctx, request, responses).await
            }
            MethodHandler::ClientStreaming(handler) => {
                let response = handler(ctx, requests).await?;
                responses.send(response).await
            }
            MethodHandler::BidiStreaming(handler) => {
                handler(ctx, ServerStream::new(requests, responses)).await
            }
        }
    }
}

/// Full method name (`/package.Service/Method`) to handler.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: MethodHandler) -> &mut Self {
        self.methods.insert(method.into(), handler);
        self
    }

    pub fn register_unary<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        self.register(
            method,
            MethodHandler::Unary(Arc::new(move |ctx, request| handler(ctx, request).boxed())),
        )
    }

    pub fn register_server_streaming<F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(RequestContext, Bytes, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(
            method,
            MethodHandler::ServerStreaming(Arc::new(move |ctx, request, sink| {
                handler(ctx, request, sink).boxed()
            })),
        )
    }

    pub fn register_client_streaming<F, Fut>(
        &mut self,
        method: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(RequestContext, RequestStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        self.register(
            method,
            MethodHandler::ClientStreaming(Arc::new(move |ctx, requests| {
                handler(ctx, requests).boxed()
            })),
        )
    }

    pub fn register_bidi<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(
            method,
            MethodHandler::BidiStreaming(Arc::new(move |ctx, stream| handler(ctx, stream).boxed())),
        )
    }

    pub fn lookup(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}
