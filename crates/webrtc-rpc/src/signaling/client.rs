use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::answerer::AnswerConnector;
use super::{
    require_host, AnswerClientStream, AnswerRequest, AnswerResponse, CallRequest, CallResponse,
    SignalingError, ANSWER_PATH, CALL_PATH, HOST_METADATA_KEY,
};
use crate::call_queue::{CallAnswer, IceCandidate, OfferHandle, OfferSignaler, QueueError};
use crate::config::{SignalingEndpoint, DEFAULT_OFFER_DEADLINE};
use crate::status::{Code, Status};

/// Remote signaling service reached over HTTP (`Call`) and WebSocket
/// (`Answer`).
#[derive(Clone)]
pub struct SignalingClient {
    endpoint: SignalingEndpoint,
    http: reqwest::Client,
}

impl SignalingClient {
    pub fn new(endpoint: SignalingEndpoint) -> Result<Self, SignalingError> {
        Url::parse(&endpoint.http_url(CALL_PATH))
            .map_err(|err| SignalingError::Transport(format!("invalid signaling address: {err}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            // the server holds a call open until the answerer replies
            .timeout(DEFAULT_OFFER_DEADLINE + Duration::from_secs(5))
            .build()
            .map_err(|err| SignalingError::Transport(err.to_string()))?;
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &SignalingEndpoint {
        &self.endpoint
    }

    /// Sends a complete offer to `host` and returns the answerer's SDP.
    pub async fn call(&self, host: &str, sdp: &str) -> Result<String, SignalingError> {
        let host = require_host(Some(host))?;
        let response = self
            .http
            .post(self.endpoint.http_url(CALL_PATH))
            .header(HOST_METADATA_KEY, host)
            .json(&CallRequest { sdp: sdp.to_string() })
            .send()
            .await
            .map_err(|err| SignalingError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let payload = response
                .json::<CallResponse>()
                .await
                .map_err(|err| SignalingError::Protocol(err.to_string()))?;
            return Ok(payload.sdp);
        }
        let body = response.text().await.unwrap_or_default();
        let failure = serde_json::from_str::<Status>(&body).unwrap_or_else(|_| {
            Status::unknown(format!("signaling call failed with HTTP {status}: {body}"))
        });
        Err(SignalingError::Status(failure))
    }

    /// Opens the `Answer` stream for `host`.
    pub async fn answer(&self, host: &str) -> Result<WsAnswerClientStream, SignalingError> {
        let host = require_host(Some(host))?;
        let mut request = self
            .endpoint
            .ws_url(ANSWER_PATH)
            .into_client_request()
            .map_err(|err| SignalingError::Transport(err.to_string()))?;
        let value = HeaderValue::from_str(host)
            .map_err(|_| SignalingError::MissingHost)?;
        request.headers_mut().insert(HOST_METADATA_KEY, value);

        let (socket, _) = connect_async(request).await.map_err(|err| match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                let code = match response.status().as_u16() {
                    400 => Code::InvalidArgument,
                    _ => Code::Unavailable,
                };
                SignalingError::Status(Status::new(
                    code,
                    format!("answer upgrade rejected with HTTP {}", response.status()),
                ))
            }
            other => SignalingError::Transport(other.to_string()),
        })?;
        debug!(target: "signaling", %host, "answer stream connected");
        Ok(WsAnswerClientStream { socket })
    }
}

/// The HTTP `Call` carries one complete SDP each way, so this signaler never
/// trickles and answers resolve as soon as the call returns.
#[async_trait]
impl OfferSignaler for SignalingClient {
    fn supports_trickle(&self) -> bool {
        false
    }

    async fn send_offer_init(
        &self,
        host: &str,
        sdp: &str,
        _disable_trickle: bool,
        cancel: &CancellationToken,
    ) -> Result<OfferHandle, QueueError> {
        if host.is_empty() {
            return Err(QueueError::EmptyHost);
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            result = self.call(host, sdp) => result,
        };
        let answer = match result {
            Ok(sdp) => CallAnswer::Init(sdp),
            Err(SignalingError::Status(status)) => match status.code() {
                Code::DeadlineExceeded => return Err(QueueError::DeadlineExceeded),
                Code::Cancelled => return Err(QueueError::Cancelled),
                _ => CallAnswer::Error(status.message().to_string()),
            },
            Err(SignalingError::MissingHost) => return Err(QueueError::EmptyHost),
            Err(err) => return Err(QueueError::Unavailable(err.to_string())),
        };
        Ok(OfferHandle::resolved(uuid, answer))
    }

    async fn send_offer_update(
        &self,
        _host: &str,
        _uuid: &str,
        _candidate: IceCandidate,
    ) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("trickled candidates"))
    }

    async fn send_offer_done(&self, _host: &str, _uuid: &str) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("trickled candidates"))
    }

    async fn send_offer_error(
        &self,
        _host: &str,
        _uuid: &str,
        _error: &str,
    ) -> Result<(), QueueError> {
        Err(QueueError::Unsupported("reporting caller errors"))
    }
}

/// Answerer end of an `Answer` stream over a client WebSocket.
pub struct WsAnswerClientStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsAnswerClientStream {
    pub async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[async_trait]
impl AnswerClientStream for WsAnswerClientStream {
    async fn send(&mut self, response: AnswerResponse) -> Result<(), SignalingError> {
        let text = serde_json::to_string(&response)
            .map_err(|err| SignalingError::Protocol(err.to_string()))?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<AnswerRequest>, SignalingError> {
        while let Some(message) = self.socket.next().await {
            let message = message.map_err(|err| SignalingError::Transport(err.to_string()))?;
            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map(Some)
                        .map_err(|err| SignalingError::Protocol(err.to_string()));
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Connects answerers to a remote signaling service.
#[derive(Clone)]
pub struct WebSocketConnector {
    client: SignalingClient,
}

impl WebSocketConnector {
    pub fn new(endpoint: SignalingEndpoint) -> Result<Self, SignalingError> {
        Ok(Self {
            client: SignalingClient::new(endpoint)?,
        })
    }
}

impl From<SignalingClient> for WebSocketConnector {
    fn from(client: SignalingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerConnector for WebSocketConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn AnswerClientStream>, SignalingError> {
        let stream = self.client.answer(host).await?;
        Ok(Box::new(stream))
    }
}
