use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, warn};

use super::{
    require_host, AnswerRequest, AnswerResponse, AnswerServerStream, CallRequest, SignalingError,
    SignalingServer, ANSWER_PATH, CALL_PATH, HOST_METADATA_KEY,
};
use crate::status::{Code, Status};

/// HTTP surface of the signaling service: `POST` [`CALL_PATH`] and the
/// WebSocket upgrade on [`ANSWER_PATH`].
pub fn router(server: Arc<SignalingServer>) -> Router {
    Router::new()
        .route(CALL_PATH, post(call_handler))
        .route(ANSWER_PATH, get(answer_handler))
        .with_state(server)
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HOST_METADATA_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Cancelled => StatusCode::REQUEST_TIMEOUT,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_response(status: Status) -> Response {
    (http_status(status.code()), Json(status)).into_response()
}

async fn call_handler(
    State(server): State<Arc<SignalingServer>>,
    headers: HeaderMap,
    Json(request): Json<CallRequest>,
) -> Response {
    // dropped with the request when the caller goes away
    let cancel = server.shutdown_token().child_token();
    let _guard = cancel.clone().drop_guard();
    match server
        .call(host_header(&headers).as_deref(), request, &cancel)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(status) => status_response(status),
    }
}

async fn answer_handler(
    State(server): State<Arc<SignalingServer>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = match require_host(host_header(&headers).as_deref()) {
        Ok(host) => host.to_string(),
        Err(err) => return status_response(err.to_status()),
    };
    ws.on_upgrade(move |socket| async move {
        let cancel = server.shutdown_token().child_token();
        let mut stream = WsAnswerServerStream::new(socket);
        match server.answer(Some(&host), &mut stream, &cancel).await {
            Ok(()) => debug!(target: "signaling", %host, "answer stream finished"),
            Err(err) if err.is_expected() => {
                debug!(target: "signaling", %host, error = %err, "answer stream ended")
            }
            Err(err) => warn!(target: "signaling", %host, error = %err, "answer stream failed"),
        }
        stream.close().await;
    })
}

/// Server end of an `Answer` stream carried as JSON text frames.
struct WsAnswerServerStream {
    socket: WebSocket,
}

impl WsAnswerServerStream {
    fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

#[async_trait]
impl AnswerServerStream for WsAnswerServerStream {
    async fn send(&mut self, request: AnswerRequest) -> Result<(), SignalingError> {
        let text = serde_json::to_string(&request)
            .map_err(|err| SignalingError::Protocol(err.to_string()))?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<AnswerResponse>, SignalingError> {
        while let Some(message) = self.socket.recv().await {
            let message = message.map_err(|err| SignalingError::Transport(err.to_string()))?;
            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map(Some)
                        .map_err(|err| SignalingError::Protocol(err.to_string()));
                }
                Message::Close(_) => return Ok(None),
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}
