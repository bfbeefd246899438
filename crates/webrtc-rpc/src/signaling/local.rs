use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::answerer::AnswerConnector;
use super::{
    require_host, AnswerClientStream, AnswerRequest, AnswerResponse, AnswerServerStream,
    SignalingError, SignalingServer,
};

/// Attaches answerers to a [`SignalingServer`] in the same process; each
/// connection is a pair of channels served by its own `answer` task.
#[derive(Clone)]
pub struct LocalAnswerConnector {
    server: Arc<SignalingServer>,
}

impl LocalAnswerConnector {
    pub fn new(server: Arc<SignalingServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl AnswerConnector for LocalAnswerConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn AnswerClientStream>, SignalingError> {
        let host = require_host(Some(host))?.to_string();
        if self.server.shutdown_token().is_cancelled() {
            return Err(SignalingError::Disconnected);
        }
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            let cancel = server.shutdown_token().child_token();
            let mut stream = LocalServerStream {
                requests: request_tx,
                responses: response_rx,
            };
            if let Err(err) = server.answer(Some(&host), &mut stream, &cancel).await {
                debug!(target: "signaling", %host, error = %err, "local answer stream ended");
            }
        });
        Ok(Box::new(LocalClientStream {
            requests: request_rx,
            responses: response_tx,
        }))
    }
}

struct LocalServerStream {
    requests: mpsc::UnboundedSender<AnswerRequest>,
    responses: mpsc::UnboundedReceiver<AnswerResponse>,
}

#[async_trait]
impl AnswerServerStream for LocalServerStream {
    async fn send(&mut self, request: AnswerRequest) -> Result<(), SignalingError> {
        self.requests
            .send(request)
            .map_err(|_| SignalingError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Option<AnswerResponse>, SignalingError> {
        Ok(self.responses.recv().await)
    }
}

struct LocalClientStream {
    requests: mpsc::UnboundedReceiver<AnswerRequest>,
    responses: mpsc::UnboundedSender<AnswerResponse>,
}

#[async_trait]
impl AnswerClientStream for LocalClientStream {
    async fn send(&mut self, response: AnswerResponse) -> Result<(), SignalingError> {
        self.responses
            .send(response)
            .map_err(|_| SignalingError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Option<AnswerRequest>, SignalingError> {
        Ok(self.requests.recv().await)
    }
}
